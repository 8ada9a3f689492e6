//! Presence registry.
//!
//! Answers "which node serves this user or session right now". The mapping
//! lives entirely in the shared [`KeyStore`]; this process keeps no copy.
//! Two views are maintained by single scripted operations:
//!
//! - session id → node id
//! - user id → {session id → node id}
//!
//! The registry never retries internally. Transient store failures surface
//! as [`CoreError::StoreUnavailable`] and callers apply
//! [`retry_idempotent`](crate::retry::retry_idempotent) where the call is
//! idempotent.

use crate::error::{CoreError, Result};
use crate::store::{KeyStore, Keyspace};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default session TTL: heartbeats must arrive more often than this.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// A per-connection session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random, unguessable session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Result of a batch [`PresenceRegistry::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Live session id → node id across all requested users.
    pub sessions: HashMap<String, String>,
    /// Live session ids per user.
    pub by_user: HashMap<String, Vec<String>>,
    /// Users with at least one live session.
    pub online: HashSet<String>,
}

impl Resolution {
    /// Node serving a session, if it is live.
    #[must_use]
    pub fn node_of(&self, session_id: &str) -> Option<&str> {
        self.sessions.get(session_id).map(String::as_str)
    }

    /// `(session id, node id)` pairs of one user.
    pub fn sessions_of<'a>(&'a self, user_id: &str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(move |sid| self.node_of(sid).map(|node| (sid.as_str(), node)))
    }
}

/// Shared presence registry.
pub struct PresenceRegistry {
    store: Arc<dyn KeyStore>,
    keys: Keyspace,
    ttl: Duration,
}

impl PresenceRegistry {
    /// Create a registry with the given session TTL.
    #[must_use]
    pub fn new(store: Arc<dyn KeyStore>, keys: Keyspace, ttl: Duration) -> Self {
        info!(ttl_ms = ttl.as_millis() as u64, "Creating presence registry");
        Self { store, keys, ttl }
    }

    /// The configured session TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bind a new session to a node.
    ///
    /// `ttl` overrides the configured window for this session.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadyBound`] if `session_id` already has a live mapping;
    /// the existing mapping is left untouched.
    pub async fn connect(
        &self,
        user_id: &str,
        session_id: &SessionId,
        node_id: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        validate_id("user id", user_id)?;
        validate_id("session id", session_id.as_str())?;
        validate_id("node id", node_id)?;

        let index = self.keys.session_index(user_id, session_id.as_str());
        let bound = self
            .store
            .bind_session(&index, node_id, ttl.unwrap_or(self.ttl))
            .await?;

        if !bound {
            warn!(user = %user_id, session = %session_id, "Session already bound");
            return Err(CoreError::AlreadyBound {
                session: session_id.to_string(),
            });
        }

        debug!(user = %user_id, session = %session_id, node = %node_id, "Session bound");
        Ok(())
    }

    /// Extend a session by the configured TTL.
    ///
    /// Returns `Ok(false)` if the session already expired; the client must
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn heartbeat(&self, user_id: &str, session_id: &SessionId) -> Result<bool> {
        let index = self.keys.session_index(user_id, session_id.as_str());
        let renewed = self.store.renew_session(&index, self.ttl).await?;

        if !renewed {
            debug!(user = %user_id, session = %session_id, "Heartbeat for expired session");
        }
        Ok(renewed)
    }

    /// Remove a session. Removing an absent session is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn disconnect(&self, user_id: &str, session_id: &SessionId) -> Result<()> {
        let index = self.keys.session_index(user_id, session_id.as_str());
        if self.store.unbind_session(&index).await? {
            debug!(user = %user_id, session = %session_id, "Session unbound");
        }
        Ok(())
    }

    /// Batch lookup of live sessions. Offline users are simply absent.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn resolve<S: AsRef<str>>(&self, user_ids: &[S]) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        if user_ids.is_empty() {
            return Ok(resolution);
        }

        let user_keys: Vec<String> = user_ids.iter().map(|u| self.keys.user(u.as_ref())).collect();
        let maps = self
            .store
            .live_sessions(&user_keys, &self.keys.session_prefix())
            .await?;

        for (user_id, sessions) in user_ids.iter().zip(maps) {
            if sessions.is_empty() {
                continue;
            }
            let user_id = user_id.as_ref().to_string();
            let ids = resolution.by_user.entry(user_id.clone()).or_default();
            for (session_id, node_id) in sessions {
                ids.push(session_id.clone());
                resolution.sessions.insert(session_id, node_id);
            }
            resolution.online.insert(user_id);
        }

        Ok(resolution)
    }

    /// Batch reverse lookup. The output has one entry per input, in order;
    /// absent sessions yield `None`.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn nodes_for(&self, session_ids: &[SessionId]) -> Result<Vec<Option<String>>> {
        let keys: Vec<String> = session_ids
            .iter()
            .map(|s| self.keys.session(s.as_str()))
            .collect();
        Ok(self.store.mget(&keys).await?)
    }

    /// Node serving a single session.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] if the session has no live mapping.
    pub async fn lookup(&self, session_id: &SessionId) -> Result<String> {
        self.store
            .get(&self.keys.session(session_id.as_str()))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))
    }

    /// Whether a user has at least one live session.
    ///
    /// # Errors
    ///
    /// Returns an error only on store failure.
    pub async fn is_online(&self, user_id: &str) -> Result<bool> {
        Ok(self.resolve(&[user_id]).await?.online.contains(user_id))
    }
}

fn validate_id(what: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CoreError::Invalid(format!("{what} cannot be empty")));
    }
    if id.len() > 256 {
        return Err(CoreError::Invalid(format!("{what} too long")));
    }
    Ok(())
}
