//! # Courier
//!
//! Messaging node: presence, sequencing and delivery.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory backends)
//! courier
//!
//! # Picks up ./courier.toml, /etc/courier/courier.toml or
//! # ~/.config/courier/courier.toml if present
//! courier
//!
//! # Run with an explicit config file
//! courier /path/to/courier.toml
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_NODE_ID=n1 COURIER_STORE__BACKEND=redis courier
//! ```

use anyhow::Result;
use courier_server::{config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_core=debug,courier_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };
    config.validate()?;

    tracing::info!(
        "Starting Courier node {} on {}:{}",
        config.node_id,
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
