//! Fixtures shared by the Courier benchmarks.

use courier_core::{
    GroupDirectory, Keyspace, MemoryArchive, MemoryBroker, MemoryStore, PoolConfig,
    PresenceRegistry, PublishPool, Router, RouterConfig, RouterParts, SequenceAllocator,
    SessionId, StoreDirectory, DEFAULT_SESSION_TTL,
};
use std::sync::Arc;

/// A single-process cluster over the in-memory backends.
pub struct Cluster {
    pub registry: Arc<PresenceRegistry>,
    pub sequences: SequenceAllocator,
    pub directory: Arc<StoreDirectory>,
    pub broker: Arc<MemoryBroker>,
    pub pool: Arc<PublishPool>,
    pub router: Router,
}

impl Cluster {
    /// Build a cluster. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let keys = Keyspace::new("bench");
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            keys.clone(),
            DEFAULT_SESSION_TTL,
        ));
        let sequences = SequenceAllocator::new(store.clone(), keys.clone());
        let directory = Arc::new(StoreDirectory::new(store, keys.clone()));
        let broker = Arc::new(MemoryBroker::new());
        let pool = Arc::new(PublishPool::start(broker.clone(), PoolConfig::default()));

        let router = Router::new(
            RouterParts {
                registry: registry.clone(),
                sequences: sequences.clone(),
                archive: Arc::new(MemoryArchive::new()),
                directory: directory.clone(),
                pool: pool.clone(),
                keys,
            },
            RouterConfig::default(),
        );

        Self {
            registry,
            sequences,
            directory,
            broker,
            pool,
            router,
        }
    }

    /// Bind `sessions` sessions for each of `users` users, spread over
    /// `nodes` nodes. Users are named `u0..`.
    pub async fn populate(&self, users: usize, sessions: usize, nodes: usize) {
        for u in 0..users {
            let user = user_id(u);
            for s in 0..sessions {
                let session = SessionId::new(format!("{user}-s{s}"));
                let node = format!("n{}", (u + s) % nodes.max(1));
                let _ = self.registry.connect(&user, &session, &node, None).await;
            }
        }
    }

    /// Create group `group_id` with members `u0..u{members}`.
    pub async fn group(&self, group_id: &str, members: usize) {
        for u in 0..members {
            let _ = self.directory.add_member(group_id, &user_id(u)).await;
        }
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Name of the `n`th fixture user.
#[must_use]
pub fn user_id(n: usize) -> String {
    format!("u{n}")
}

/// A multi-threaded runtime for driving async code from criterion.
///
/// # Errors
///
/// Returns an error if the runtime cannot be built.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
}
