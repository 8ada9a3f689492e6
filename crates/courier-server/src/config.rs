//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (COURIER_*)

use anyhow::{bail, Context, Result};
use courier_core::{PoolConfig, RetryPolicy, RouterConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity of this node in the cluster.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Shared store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Session liveness.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Publish pool sizing.
    #[serde(default)]
    pub pool: PoolSection,

    /// Retry policy for idempotent store calls.
    #[serde(default)]
    pub retry: RetrySection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Client authentication.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which store and broker backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Single process only. Nothing survives a restart.
    Memory,
    /// Shared Redis store and pub/sub.
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Connection URL for the redis backend.
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace for every key and topic.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Session liveness window in milliseconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_ms: u64,

    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Deadline for a single store-backed request, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Publish pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message body size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum items returned by one sync.
    #[serde(default = "default_max_sync_batch")]
    pub max_sync_batch: usize,
}

/// Static token table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted client token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub client_id: String,
    pub user_id: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_node_id() -> String {
    std::env::var("COURIER_NODE_ID").unwrap_or_else(|_| "node-1".to_string())
}

fn default_backend() -> Backend {
    Backend::Memory
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "courier".to_string()
}

fn default_session_ttl() -> u64 {
    30 * 60 * 1000 // 30 minutes
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_request_timeout() -> u64 {
    2_000
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_sync_batch() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: default_node_id(),
            store: StoreConfig::default(),
            presence: PresenceConfig::default(),
            pool: PoolSection::default(),
            retry: RetrySection::default(),
            limits: LimitsConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: default_session_ttl(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_sync_batch: default_max_sync_batch(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `COURIER_*` environment variables layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        let found = config_paths
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());
        Self::assemble(found.as_deref().map(Path::new))
    }

    /// Load configuration from a specific file, with `COURIER_*`
    /// environment variables layered on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("Config file not found: {}", path.display());
        }
        Self::assemble(Some(path))
    }

    fn assemble(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::new(
                &path.to_string_lossy(),
                config::FileFormat::Toml,
            ));
        }

        builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Reject settings the node cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("node_id cannot be empty");
        }
        if self.presence.heartbeat_interval_ms >= self.presence.session_ttl_ms {
            bail!(
                "presence.heartbeat_interval_ms ({}) must be shorter than presence.session_ttl_ms ({})",
                self.presence.heartbeat_interval_ms,
                self.presence.session_ttl_ms
            );
        }
        if self.pool.workers == 0 {
            bail!("pool.workers must be at least 1");
        }
        if self.pool.queue_capacity == 0 {
            bail!("pool.queue_capacity must be at least 1");
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be at least 1");
        }
        if self.limits.max_sync_batch == 0 {
            bail!("limits.max_sync_batch must be at least 1");
        }
        if self.presence.heartbeat_interval_ms > u64::from(u32::MAX) {
            bail!("presence.heartbeat_interval_ms is too large");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.presence.session_ttl_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.presence.request_timeout_ms)
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers,
            queue_capacity: self.pool.queue_capacity,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_attempts: self.retry.max_attempts,
        }
    }

    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_body_size: self.limits.max_message_size,
            max_sync_batch: self.limits.max_sync_batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.backend, Backend::Memory);
        assert_eq!(config.presence.session_ttl_ms, 30 * 60 * 1000);
        assert!(config.auth.tokens.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            node_id = "n7"

            [store]
            backend = "redis"
            url = "redis://cache:6379"

            [presence]
            session_ttl_ms = 60000
            heartbeat_interval_ms = 10000

            [[auth.tokens]]
            token = "secret"
            client_id = "ios"
            user_id = "u1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.node_id, "n7");
        assert_eq!(config.store.backend, Backend::Redis);
        assert_eq!(config.store.key_prefix, "courier");
        assert_eq!(config.session_ttl(), Duration::from_secs(60));
        assert_eq!(config.auth.tokens[0].user_id, "u1");
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_ttl() {
        let mut config = Config::default();
        config.presence.heartbeat_interval_ms = config.presence.session_ttl_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_pool_and_node() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node_id = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = Config::default();
        config.limits.max_sync_batch = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_message_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("courier-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "node_id = \"n3\"\n[limits]\nmax_sync_batch = 25\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.node_id, "n3");
        assert_eq!(config.limits.max_sync_batch, 25);
        assert_eq!(config.store.backend, Backend::Memory);

        assert!(Config::from_file(&path).is_err());
    }
}
