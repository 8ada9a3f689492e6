//! # courier-server
//!
//! A Courier node: binds client sessions over WebSocket, routes their
//! messages through the shared store, and delivers notifications published
//! to this node's inbox topic.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod listener;
pub mod metrics;
pub mod session;
pub mod sessions;
pub mod state;

pub use config::Config;
pub use handlers::{run_server, serve};
pub use state::{AppState, Backends};
