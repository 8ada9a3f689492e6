//! KeyStore adapter over the shared key-value store.
//!
//! Plain primitives (`get`, `set`, `expire`, `delete`, `mget`, `incr`, set
//! membership) plus the scripted dual-index operations the presence registry
//! relies on. Every method is a single indivisible operation on the store;
//! nothing here performs a client-side read-modify-write.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The two keys holding one session's registry entry.
///
/// `session_key` is a plain value holding the node id. `user_key` is a hash
/// of session id to node id covering every session the user has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIndex {
    pub session_key: String,
    pub user_key: String,
    pub session_id: String,
}

/// Live sessions of one user, session id to node id.
pub type SessionMap = HashMap<String, String>;

/// Atomic primitives over a shared key-value store.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Round-trip to the store.
    async fn ping(&self) -> StoreResult<()>;

    /// Read a string value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a key. Returns false if it was already absent.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Batched read preserving input order; absent keys yield `None`.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Atomically increment an integer counter and return the new value.
    async fn incr(&self, key: &str) -> StoreResult<u64>;

    /// Add a member to a set. Returns false if already present.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set. Returns false if it was absent.
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Set membership test.
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Compare-and-set both index entries of a session.
    ///
    /// Writes nothing and returns false if `session_key` already exists.
    /// Otherwise writes the session entry and the user hash field, gives the
    /// session entry `ttl`, and extends the user hash TTL to at least `ttl`.
    async fn bind_session(&self, index: &SessionIndex, node: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Extend both entries of a live session to `ttl`.
    ///
    /// Returns false if the session entry is gone or is not listed under this
    /// user; a stale user hash field is removed in that case.
    async fn renew_session(&self, index: &SessionIndex, ttl: Duration) -> StoreResult<bool>;

    /// Remove both entries of a session owned by this user.
    ///
    /// Returns false if the user hash did not list the session.
    async fn unbind_session(&self, index: &SessionIndex) -> StoreResult<bool>;

    /// Read the user hashes at `user_keys`, keeping only fields whose session
    /// entry (`session_prefix` + session id) still points at the same node.
    /// Stale fields are pruned in the same operation. Output order matches
    /// `user_keys`.
    async fn live_sessions(
        &self,
        user_keys: &[String],
        session_prefix: &str,
    ) -> StoreResult<Vec<SessionMap>>;
}

/// Key layout shared by every component that touches the store.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Namespace all keys under `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix of every session entry; the session id follows.
    #[must_use]
    pub fn session_prefix(&self) -> String {
        format!("{}:sess:", self.prefix)
    }

    /// Session id to node id.
    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        format!("{}{}", self.session_prefix(), session_id)
    }

    /// Hash of session id to node id for a user.
    #[must_use]
    pub fn user(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    /// Both index keys of one session.
    #[must_use]
    pub fn session_index(&self, user_id: &str, session_id: &str) -> SessionIndex {
        SessionIndex {
            session_key: self.session(session_id),
            user_key: self.user(user_id),
            session_id: session_id.to_string(),
        }
    }

    /// Sequence counter of a scope.
    #[must_use]
    pub fn sequence(&self, scope: &str) -> String {
        format!("{}:seq:{}", self.prefix, scope)
    }

    /// Member set of a group.
    #[must_use]
    pub fn group_members(&self, group_id: &str) -> String {
        format!("{}:group:{}:members", self.prefix, group_id)
    }

    /// Stored envelope of a message.
    #[must_use]
    pub fn message(&self, message_id: &str) -> String {
        format!("{}:msg:{}", self.prefix, message_id)
    }

    /// Sorted delivery records of a scope.
    #[must_use]
    pub fn inbox(&self, scope: &str) -> String {
        format!("{}:inbox:{}", self.prefix, scope)
    }

    /// Broker topic of a node.
    #[must_use]
    pub fn node_topic(&self, node_id: &str) -> String {
        format!("{}:node:{}", self.prefix, node_id)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("courier")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_layout() {
        let keys = Keyspace::new("im");
        assert_eq!(keys.session("s1"), "im:sess:s1");
        assert_eq!(keys.user("u1"), "im:user:u1");
        assert_eq!(keys.sequence("g:team"), "im:seq:g:team");
        assert_eq!(keys.node_topic("n1"), "im:node:n1");

        let index = keys.session_index("u1", "s1");
        assert!(index.session_key.starts_with(&keys.session_prefix()));
        assert_eq!(index.session_id, "s1");
    }
}
