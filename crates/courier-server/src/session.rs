//! Per-connection request handling.
//!
//! A [`ClientSession`] exists once the Connect handshake has bound a session
//! in the registry. It turns each client frame into a registry or router
//! call and decides what goes back on the socket.

use crate::metrics;
use crate::state::AppState;
use courier_core::{
    retry_idempotent, with_deadline, Accepted, CoreError, OutboundMessage, SessionId,
};
use courier_protocol::{codes, negotiate, ConversationKind, Frame, Scope};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the socket task should do after a frame.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Send a frame and keep reading.
    Reply(Frame),
    /// Send the push acknowledgement, then dispatch the stored message.
    Pushed(Frame, Accepted),
    /// Nothing to send.
    Silent,
    /// Optionally send a last frame, then close the socket.
    Close(Option<Frame>),
}

/// Wire code for a core error.
#[must_use]
pub fn error_code(e: &CoreError) -> u16 {
    match e {
        CoreError::AlreadyBound { .. } => codes::ALREADY_BOUND,
        CoreError::NotFound(_) | CoreError::Invalid(_) => codes::BAD_REQUEST,
        CoreError::Forbidden(_) => codes::FORBIDDEN,
        CoreError::StoreUnavailable(_) => codes::UNAVAILABLE,
        CoreError::Timeout => codes::TIMEOUT,
        CoreError::Internal(_) => codes::INTERNAL,
    }
}

fn error_frame(id: u64, e: &CoreError) -> Frame {
    let code = error_code(e);
    metrics::record_error(code);
    Frame::error(id, code, e.to_string())
}

fn reject(id: u64, code: u16, message: impl Into<String>) -> Frame {
    metrics::record_error(code);
    Frame::error(id, code, message)
}

/// A bound client session.
pub struct ClientSession {
    id: SessionId,
    user_id: String,
    state: Arc<AppState>,
    bound: bool,
}

impl ClientSession {
    /// Run the Connect handshake: negotiate the version, validate the
    /// token and bind a fresh session id to this node.
    ///
    /// # Errors
    ///
    /// The error frame to send before closing the socket.
    pub async fn open(
        state: Arc<AppState>,
        version: u8,
        token: &str,
    ) -> Result<(Self, Frame), Frame> {
        let version = negotiate(version)
            .map_err(|e| reject(0, codes::BAD_REQUEST, e.to_string()))?;
        let identity = state
            .tokens
            .validate(token)
            .ok_or_else(|| reject(0, codes::UNAUTHORIZED, "Invalid token"))?;

        let id = SessionId::generate();
        // Not idempotent: a retry after a lost reply would hit AlreadyBound.
        with_deadline(
            state.config.request_timeout(),
            state
                .registry
                .connect(&identity.user_id, &id, &state.config.node_id, None),
        )
        .await
        .map_err(|e| {
            warn!(user = %identity.user_id, error = %e, "Connect failed");
            error_frame(0, &e)
        })?;

        info!(
            user = %identity.user_id,
            client = %identity.client_id,
            session = %id,
            "Session connected"
        );

        let connected = Frame::connected(
            id.as_str(),
            state.config.node_id.as_str(),
            version,
            u32::try_from(state.config.presence.heartbeat_interval_ms).unwrap_or(u32::MAX),
        );

        Ok((
            Self {
                id,
                user_id: identity.user_id,
                state,
                bound: true,
            },
            connected,
        ))
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Handle one client frame.
    pub async fn handle(&mut self, frame: Frame) -> Outcome {
        match frame {
            Frame::Heartbeat { id } => self.heartbeat(id).await,

            Frame::Push {
                id,
                recipient,
                kind,
                content_type,
                body,
                mentions,
            } => {
                if body.len() > self.state.config.limits.max_message_size {
                    return Outcome::Reply(reject(id, codes::TOO_LARGE, "Message body too large"));
                }
                let message = match kind {
                    ConversationKind::Single => {
                        OutboundMessage::direct(self.user_id.as_str(), recipient, body)
                    }
                    ConversationKind::Group => {
                        OutboundMessage::group(self.user_id.as_str(), recipient, body)
                    }
                }
                .with_content_type(content_type)
                .with_mentions(mentions);

                self.push(id, message).await
            }

            Frame::Sync {
                id,
                scope,
                after,
                limit,
            } => Outcome::Reply(self.sync(id, scope, after, limit).await),

            Frame::Ack { id, message_id } => {
                let (state, user_id, message_id) =
                    (&self.state, self.user_id.as_str(), message_id.as_str());
                let result = retry_idempotent(&state.retry, move || {
                    with_deadline(
                        state.config.request_timeout(),
                        state.router.acknowledge(user_id, message_id),
                    )
                })
                .await;
                match result {
                    Ok(()) => Outcome::Silent,
                    Err(e) => Outcome::Reply(error_frame(id, &e)),
                }
            }

            Frame::Disconnect => {
                self.close().await;
                Outcome::Close(None)
            }

            Frame::Connect { .. } => {
                Outcome::Reply(reject(0, codes::BAD_REQUEST, "Session already connected"))
            }

            other => {
                warn!(session = %self.id, frame_type = ?other.frame_type(), "Unexpected frame from client");
                Outcome::Reply(reject(0, codes::BAD_REQUEST, "Unexpected frame"))
            }
        }
    }

    async fn heartbeat(&mut self, id: u64) -> Outcome {
        let (state, user_id, session_id) = (&self.state, self.user_id.as_str(), &self.id);
        let result = retry_idempotent(&state.retry, move || {
            with_deadline(
                state.config.request_timeout(),
                state.registry.heartbeat(user_id, session_id),
            )
        })
        .await;

        match result {
            Ok(true) => Outcome::Reply(Frame::HeartbeatAck { id, renewed: true }),
            Ok(false) => {
                metrics::record_heartbeat_miss();
                info!(user = %self.user_id, session = %self.id, "Session expired, forcing reconnect");
                self.bound = false;
                Outcome::Close(Some(reject(id, codes::SESSION_EXPIRED, "Session expired")))
            }
            Err(e) => Outcome::Reply(error_frame(id, &e)),
        }
    }

    async fn push(&self, id: u64, message: OutboundMessage) -> Outcome {
        let started = Instant::now();
        // Not idempotent: a retry would allocate new sequences. The deadline
        // covers allocation and persistence only.
        let result = with_deadline(
            self.state.config.request_timeout(),
            self.state.router.accept(message),
        )
        .await;

        match result {
            Ok(accepted) => {
                metrics::record_push(started.elapsed().as_secs_f64());
                debug!(
                    session = %self.id,
                    message = %accepted.message_id(),
                    seq = accepted.sequence(),
                    "Push accepted"
                );
                let ack = Frame::PushAck {
                    id,
                    message_id: accepted.message_id().to_string(),
                    sequence: accepted.sequence(),
                };
                Outcome::Pushed(ack, accepted)
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "Push failed");
                Outcome::Reply(error_frame(id, &e))
            }
        }
    }

    /// Deliver an acknowledged message. Waits while the publish pool is
    /// saturated, which holds back this connection's next request.
    pub async fn dispatch(&self, accepted: Accepted) {
        let message_id = accepted.message_id().to_string();
        let jobs = self.state.router.dispatch(accepted).await;
        debug!(session = %self.id, message = %message_id, jobs, "Push dispatched");
    }

    async fn sync(&self, id: u64, raw_scope: String, after: u64, limit: u32) -> Frame {
        let scope: Scope = match raw_scope.parse() {
            Ok(scope) => scope,
            Err(e) => return reject(id, codes::BAD_REQUEST, e),
        };

        let (state, user_id, scope) = (&self.state, self.user_id.as_str(), &scope);
        let result = retry_idempotent(&state.retry, move || {
            with_deadline(
                state.config.request_timeout(),
                state.router.sync(user_id, scope, after, limit as usize),
            )
        })
        .await;

        match result {
            Ok(items) => Frame::SyncBatch {
                id,
                scope: raw_scope,
                items,
            },
            Err(e) => error_frame(id, &e),
        }
    }

    /// Unbind the session if it is still bound. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.state.sessions.remove(&self.id);
        if !self.bound {
            return;
        }
        self.bound = false;

        let (state, user_id, session_id) = (&self.state, self.user_id.as_str(), &self.id);
        let result = retry_idempotent(&state.retry, move || {
            with_deadline(
                state.config.request_timeout(),
                state.registry.disconnect(user_id, session_id),
            )
        })
        .await;

        match result {
            Ok(()) => info!(user = %self.user_id, session = %self.id, "Session disconnected"),
            Err(e) => {
                warn!(user = %self.user_id, session = %self.id, error = %e, "Unbind failed, left to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TokenEntry};
    use crate::state::Backends;

    fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.node_id = "n1".into();
        config.auth.tokens = vec![
            TokenEntry {
                token: "t1".into(),
                client_id: "web".into(),
                user_id: "u1".into(),
            },
            TokenEntry {
                token: "t2".into(),
                client_id: "web".into(),
                user_id: "u2".into(),
            },
        ];
        Arc::new(AppState::new(config, Backends::memory()))
    }

    #[tokio::test]
    async fn test_open_binds_session() {
        let state = state();
        let (session, connected) = ClientSession::open(state.clone(), 1, "t1").await.unwrap();

        let Frame::Connected {
            session_id,
            node_id,
            version,
            ..
        } = connected
        else {
            panic!("expected Connected");
        };
        assert_eq!(session_id, session.id().as_str());
        assert_eq!(node_id, "n1");
        assert_eq!(version, 1);
        assert_eq!(state.registry.lookup(session.id()).await.unwrap(), "n1");
    }

    #[tokio::test]
    async fn test_open_rejects_bad_token_and_version() {
        let state = state();
        let Err(Frame::Error { code, .. }) = ClientSession::open(state.clone(), 1, "nope").await
        else {
            panic!("expected rejection");
        };
        assert_eq!(code, codes::UNAUTHORIZED);

        let Err(Frame::Error { code, .. }) = ClientSession::open(state, 0, "t1").await else {
            panic!("expected rejection");
        };
        assert_eq!(code, codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_then_sync() {
        let state = state();
        let (mut sender, _) = ClientSession::open(state.clone(), 1, "t2").await.unwrap();
        let (mut recipient, _) = ClientSession::open(state.clone(), 1, "t1").await.unwrap();

        let outcome = sender.handle(Frame::push_direct(7, "u1", b"hi".to_vec())).await;
        let Outcome::Pushed(Frame::PushAck { id, sequence, .. }, accepted) = outcome else {
            panic!("expected PushAck, got {outcome:?}");
        };
        assert_eq!((id, sequence), (7, 1));
        sender.dispatch(accepted).await;

        let outcome = recipient.handle(Frame::sync(8, "u:u1", 0, 50)).await;
        let Outcome::Reply(Frame::SyncBatch { items, .. }) = outcome else {
            panic!("expected SyncBatch, got {outcome:?}");
        };
        assert_eq!(items.len(), 1);

        let outcome = sender.handle(Frame::sync(9, "u:u1", 0, 50)).await;
        assert!(matches!(
            outcome,
            Outcome::Reply(Frame::Error { code: codes::FORBIDDEN, .. })
        ));

        let outcome = sender.handle(Frame::sync(10, "bogus", 0, 50)).await;
        assert!(matches!(
            outcome,
            Outcome::Reply(Frame::Error { code: codes::BAD_REQUEST, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_push_is_rejected() {
        let state = state();
        let (mut session, _) = ClientSession::open(state.clone(), 1, "t1").await.unwrap();
        let body = vec![0u8; state.config.limits.max_message_size + 1];

        let outcome = session.handle(Frame::push_direct(1, "u2", body)).await;
        assert!(matches!(
            outcome,
            Outcome::Reply(Frame::Error { code: codes::TOO_LARGE, .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_and_disconnect() {
        let state = state();
        let (mut session, _) = ClientSession::open(state.clone(), 1, "t1").await.unwrap();

        assert_eq!(
            session.handle(Frame::heartbeat(3)).await,
            Outcome::Reply(Frame::HeartbeatAck { id: 3, renewed: true })
        );

        assert_eq!(session.handle(Frame::Disconnect).await, Outcome::Close(None));
        assert!(!state.registry.is_online("u1").await.unwrap());

        // The session is gone: the next heartbeat forces a reconnect.
        let outcome = session.handle(Frame::heartbeat(4)).await;
        assert!(matches!(
            outcome,
            Outcome::Close(Some(Frame::Error { code: codes::SESSION_EXPIRED, .. }))
        ));
    }

    #[tokio::test]
    async fn test_push_is_acknowledged_before_dispatch() {
        let state = state();
        let (mut sender, _) = ClientSession::open(state.clone(), 1, "t2").await.unwrap();
        let (recipient, _) = ClientSession::open(state.clone(), 1, "t1").await.unwrap();
        let mut outbox = state.sessions.register(recipient.id(), recipient.user_id());
        let inbox = crate::listener::spawn_inbox(
            state.broker.clone(),
            state.inbox_topic(),
            "n1".into(),
            state.sessions.clone(),
        )
        .await
        .unwrap();

        let outcome = sender.handle(Frame::push_direct(1, "u1", b"hi".to_vec())).await;
        let Outcome::Pushed(Frame::PushAck { message_id, .. }, accepted) = outcome else {
            panic!("expected PushAck, got {outcome:?}");
        };
        assert_eq!(state.router.stats().pushed, 1);
        assert_eq!(state.router.stats().dispatched, 0);

        sender.dispatch(accepted).await;
        assert_eq!(state.router.stats().dispatched, 1);

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), outbox.recv())
            .await
            .unwrap()
            .unwrap();
        let Frame::Deliver { item } = delivered else {
            panic!("expected Deliver, got {delivered:?}");
        };
        assert_eq!(item.envelope.message_id, message_id);
        inbox.abort();
    }
}
