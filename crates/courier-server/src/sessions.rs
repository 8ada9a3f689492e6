//! Sessions held by this node.
//!
//! Maps a session id to the outbox of its WebSocket task. The inbox listener
//! pushes deliveries here; the socket task drains its outbox.

use courier_core::SessionId;
use courier_protocol::{Frame, SessionDelivery};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Frames queued per session before deliveries are dropped.
pub const OUTBOX_CAPACITY: usize = 256;

struct LocalSession {
    user_id: String,
    outbox: mpsc::Sender<Frame>,
}

/// Table of sessions bound to this node.
#[derive(Clone, Default)]
pub struct LocalSessions {
    inner: Arc<DashMap<String, LocalSession>>,
}

impl LocalSessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and return the receiving end of its outbox.
    pub fn register(&self, session_id: &SessionId, user_id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        self.inner.insert(
            session_id.to_string(),
            LocalSession {
                user_id: user_id.to_string(),
                outbox: tx,
            },
        );
        rx
    }

    /// Forget a session. Returns false if it was not registered.
    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.inner.remove(session_id.as_str()).is_some()
    }

    /// Remove every session, returning `(user id, session id)` pairs.
    /// Dropping the outboxes tells each socket task to close.
    pub fn drain(&self) -> Vec<(String, SessionId)> {
        let ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.inner.remove(&id))
            .map(|(id, session)| (session.user_id, SessionId::new(id)))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Queue a delivery for a local session without waiting.
    ///
    /// Returns false if the session is not here, belongs to another user,
    /// or its outbox is full. The message stays in the archive either way.
    pub fn deliver(&self, delivery: SessionDelivery) -> bool {
        let Some(session) = self.inner.get(&delivery.session_id) else {
            debug!(session = %delivery.session_id, "Delivery for unknown session dropped");
            return false;
        };
        if session.user_id != delivery.user_id {
            warn!(
                session = %delivery.session_id,
                user = %delivery.user_id,
                "Delivery for a different user dropped"
            );
            return false;
        }

        match session.outbox.try_send(Frame::Deliver {
            item: delivery.item,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session = %delivery.session_id, "Session outbox full, delivery dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %delivery.session_id, "Session closing, delivery dropped");
                false
            }
        }
    }
}
