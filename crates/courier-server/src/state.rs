//! Shared node state.

use crate::auth::{StaticTokens, TokenValidator};
use crate::config::{Backend, Config};
use crate::sessions::LocalSessions;
use anyhow::{Context, Result};
use courier_core::{
    with_deadline, Broker, GroupDirectory, KeyStore, Keyspace, MemoryArchive, MemoryBroker,
    MemoryStore, MessageArchive, PresenceRegistry, PublishPool, RedisArchive, RedisBroker,
    RedisStore, RetryPolicy, Router, RouterParts, SequenceAllocator, StoreDirectory,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Store, archive and broker a node runs against.
pub struct Backends {
    pub store: Arc<dyn KeyStore>,
    pub archive: Arc<dyn MessageArchive>,
    pub broker: Arc<dyn Broker>,
}

impl Backends {
    /// Single-process backends.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            archive: Arc::new(MemoryArchive::new()),
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    /// Backends shared through Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis cannot be reached.
    pub async fn redis(url: &str, keys: &Keyspace) -> Result<Self> {
        let store = RedisStore::connect(url)
            .await
            .with_context(|| format!("Failed to connect to Redis at {url}"))?;
        let broker = RedisBroker::connect(url)
            .await
            .context("Failed to open Redis broker")?;
        let archive = RedisArchive::new(store.connection(), keys.clone());

        Ok(Self {
            store: Arc::new(store),
            archive: Arc::new(archive),
            broker: Arc::new(broker),
        })
    }

    /// Backends selected by `[store]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured backend cannot be reached.
    pub async fn from_config(config: &Config, keys: &Keyspace) -> Result<Self> {
        match config.store.backend {
            Backend::Memory => {
                warn!("Using in-memory backends; state is local to this node");
                Ok(Self::memory())
            }
            Backend::Redis => Self::redis(&config.store.url, keys).await,
        }
    }
}

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub keys: Keyspace,
    pub store: Arc<dyn KeyStore>,
    pub registry: Arc<PresenceRegistry>,
    pub directory: Arc<dyn GroupDirectory>,
    pub router: Router,
    pub broker: Arc<dyn Broker>,
    pub pool: Arc<PublishPool>,
    pub sessions: LocalSessions,
    pub tokens: Arc<dyn TokenValidator>,
    pub retry: RetryPolicy,
}

impl AppState {
    /// Wire the core components over `backends`. Must run inside a tokio
    /// runtime: the publish pool spawns its workers here.
    #[must_use]
    pub fn new(config: Config, backends: Backends) -> Self {
        let keys = Keyspace::new(config.store.key_prefix.clone());
        let registry = Arc::new(PresenceRegistry::new(
            Arc::clone(&backends.store),
            keys.clone(),
            config.session_ttl(),
        ));
        let directory: Arc<dyn GroupDirectory> = Arc::new(StoreDirectory::new(
            Arc::clone(&backends.store),
            keys.clone(),
        ));
        let pool = Arc::new(PublishPool::start(
            Arc::clone(&backends.broker),
            config.pool_config(),
        ));

        let router = Router::new(
            RouterParts {
                registry: Arc::clone(&registry),
                sequences: SequenceAllocator::new(Arc::clone(&backends.store), keys.clone()),
                archive: backends.archive,
                directory: Arc::clone(&directory),
                pool: Arc::clone(&pool),
                keys: keys.clone(),
            },
            config.router_config(),
        );

        let tokens = StaticTokens::from_config(&config.auth);
        if tokens.is_empty() {
            warn!("No client tokens configured; every connect will be rejected");
        }

        Self {
            retry: config.retry_policy(),
            keys,
            store: backends.store,
            registry,
            directory,
            router,
            broker: backends.broker,
            pool,
            sessions: LocalSessions::new(),
            tokens: Arc::new(tokens),
            config,
        }
    }

    /// Topic this node listens on.
    #[must_use]
    pub fn inbox_topic(&self) -> String {
        self.keys.node_topic(&self.config.node_id)
    }

    /// Unbind every local session and drain the publish pool.
    pub async fn shutdown(&self) {
        let drained = self.sessions.drain();
        info!(sessions = drained.len(), "Unbinding local sessions");

        for (user_id, session_id) in drained {
            let result = with_deadline(
                self.config.request_timeout(),
                self.registry.disconnect(&user_id, &session_id),
            )
            .await;
            if let Err(e) = result {
                warn!(user = %user_id, session = %session_id, error = %e, "Unbind on shutdown failed");
            }
        }

        self.pool.shutdown().await;
    }
}
