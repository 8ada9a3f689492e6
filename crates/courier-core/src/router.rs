//! Message router.
//!
//! Every outbound message goes through the same steps:
//!
//! 1. allocate a sequence per recipient scope,
//! 2. persist the envelope and delivery records,
//! 3. resolve the live sessions of the recipients,
//! 4. hand one notification per serving node to the publish pool,
//! 5. acknowledge with the message id and sequence.
//!
//! Steps 1 and 2 decide the outcome: their failures reach the caller.
//! Steps 3 and 4 are best effort and only logged; offline or unreachable
//! recipients catch up by pulling their inbox. [`Router::accept`] runs the
//! first two and [`Router::dispatch`] the rest, so a caller can acknowledge
//! before a saturated pool makes dispatch wait.

use crate::archive::{DeliveryRecord, MessageArchive};
use crate::directory::GroupDirectory;
use crate::error::{CoreError, Result};
use crate::message::OutboundMessage;
use crate::pool::{PublishJob, PublishPool};
use crate::presence::PresenceRegistry;
use crate::sequence::SequenceAllocator;
use crate::store::Keyspace;
use bytes::Bytes;
use courier_protocol::{
    codec, ConversationKind, DeliveryItem, Envelope, Frame, MessageStatus, ProtocolError, Scope,
    SessionDelivery,
};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Largest accepted message body in bytes.
    pub max_body_size: usize,
    /// Upper bound on items returned by one sync.
    pub max_sync_batch: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_body_size: 64 * 1024,
            max_sync_batch: 200,
        }
    }
}

/// Result of an accepted push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    /// Assigned message id.
    pub message_id: String,
    /// Scope whose sequence is reported: recipient inbox or group timeline.
    pub scope: Scope,
    /// Sequence within `scope`.
    pub sequence: u64,
    /// Publish jobs handed to the pool. Zero when only accepted.
    pub dispatched: usize,
}

/// A sequenced and persisted message awaiting dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    envelope: Envelope,
    primary: DeliveryRecord,
    deliveries: Vec<(String, DeliveryRecord)>,
}

impl Accepted {
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }

    /// Scope whose sequence is reported to the sender.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.primary.scope
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.primary.sequence
    }

    /// Receipt for the sender, before any dispatch.
    #[must_use]
    pub fn receipt(&self) -> PushReceipt {
        PushReceipt {
            message_id: self.envelope.message_id.clone(),
            scope: self.primary.scope.clone(),
            sequence: self.primary.sequence,
            dispatched: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    dispatched: AtomicU64,
    offline: AtomicU64,
    dispatch_failures: AtomicU64,
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages persisted and acknowledged.
    pub pushed: u64,
    /// Publish jobs submitted.
    pub dispatched: u64,
    /// Recipient deliveries skipped because no session was live.
    pub offline: u64,
    /// Resolve or submit failures swallowed during dispatch.
    pub dispatch_failures: u64,
}

/// The components a [`Router`] drives.
pub struct RouterParts {
    pub registry: Arc<PresenceRegistry>,
    pub sequences: SequenceAllocator,
    pub archive: Arc<dyn MessageArchive>,
    pub directory: Arc<dyn GroupDirectory>,
    pub pool: Arc<PublishPool>,
    pub keys: Keyspace,
}

/// Sequencer and dispatcher for outbound messages.
pub struct Router {
    registry: Arc<PresenceRegistry>,
    sequences: SequenceAllocator,
    archive: Arc<dyn MessageArchive>,
    directory: Arc<dyn GroupDirectory>,
    pool: Arc<PublishPool>,
    keys: Keyspace,
    config: RouterConfig,
    counters: Counters,
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(parts: RouterParts, config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            registry: parts.registry,
            sequences: parts.sequences,
            archive: parts.archive,
            directory: parts.directory,
            pool: parts.pool,
            keys: parts.keys,
            config,
            counters: Counters::default(),
        }
    }

    /// The presence registry this router resolves against.
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// The message archive this router persists to.
    #[must_use]
    pub fn archive(&self) -> &Arc<dyn MessageArchive> {
        &self.archive
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            offline: self.counters.offline.load(Ordering::Relaxed),
            dispatch_failures: self.counters.dispatch_failures.load(Ordering::Relaxed),
        }
    }

    /// Sequence, persist and dispatch a message.
    ///
    /// Equivalent to [`accept`](Self::accept) followed by
    /// [`dispatch`](Self::dispatch).
    ///
    /// # Errors
    ///
    /// Fails only if validation, sequence allocation, group lookup or
    /// persistence fails. An offline or unreachable recipient is not an error.
    pub async fn push_message(&self, message: OutboundMessage) -> Result<PushReceipt> {
        let accepted = self.accept(message).await?;
        let mut receipt = accepted.receipt();
        receipt.dispatched = self.dispatch(accepted).await;
        Ok(receipt)
    }

    /// Allocate sequences and persist a message. Once this returns `Ok` the
    /// message is durable and the caller may be acknowledged; delivery is
    /// left to [`dispatch`](Self::dispatch).
    ///
    /// # Errors
    ///
    /// Fails if validation, sequence allocation, group lookup or persistence
    /// fails.
    pub async fn accept(&self, message: OutboundMessage) -> Result<Accepted> {
        message.validate(self.config.max_body_size)?;

        let (envelope, primary, deliveries) = match message.kind {
            ConversationKind::Single => self.allocate_direct(message).await?,
            ConversationKind::Group => self.allocate_group(message).await?,
        };

        // A direct message has a single record that doubles as the primary.
        let mut records = vec![primary.clone()];
        records.extend(
            deliveries
                .iter()
                .map(|(_, record)| record.clone())
                .filter(|record| *record != primary),
        );

        if let Err(e) = self.archive.store(&envelope, &records).await {
            error!(message = %envelope.message_id, error = %e, "Failed to persist message");
            return Err(e);
        }
        self.counters.pushed.fetch_add(1, Ordering::Relaxed);

        debug!(
            message = %envelope.message_id,
            scope = %primary.scope,
            seq = primary.sequence,
            "Message accepted"
        );

        Ok(Accepted {
            envelope,
            primary,
            deliveries,
        })
    }

    /// One sequence in the recipient inbox.
    async fn allocate_direct(
        &self,
        message: OutboundMessage,
    ) -> Result<(Envelope, DeliveryRecord, Vec<(String, DeliveryRecord)>)> {
        let scope = message.primary_scope();
        let sequence = self.sequences.next(&scope).await?;
        let record = DeliveryRecord::new(scope, sequence);
        let recipient = message.recipient_id.clone();

        Ok((
            message.into_envelope(),
            record.clone(),
            vec![(recipient, record)],
        ))
    }

    /// One sequence in the group timeline plus one per member inbox.
    async fn allocate_group(
        &self,
        message: OutboundMessage,
    ) -> Result<(Envelope, DeliveryRecord, Vec<(String, DeliveryRecord)>)> {
        let group_id = message.recipient_id.clone();
        let members = self.directory.members(&group_id).await?;
        if members.is_empty() {
            return Err(CoreError::NotFound(format!("group {group_id} has no members")));
        }

        let group_scope = message.primary_scope();
        let group_seq = self.sequences.next(&group_scope).await?;

        let member_records = try_join_all(members.into_iter().map(|member| async move {
            let scope = Scope::user(&member);
            let sequence = self.sequences.next(&scope).await?;
            Ok::<_, CoreError>((member, DeliveryRecord::new(scope, sequence)))
        }))
        .await?;

        Ok((
            message.into_envelope(),
            DeliveryRecord::new(group_scope, group_seq),
            member_records,
        ))
    }

    /// Resolve the recipients of an accepted message and hand one
    /// notification per serving node to the publish pool. Waits while the
    /// pool is saturated. Returns the number of jobs submitted; failures are
    /// logged and swallowed.
    pub async fn dispatch(&self, accepted: Accepted) -> usize {
        let Accepted {
            envelope,
            deliveries,
            ..
        } = accepted;

        let users: Vec<&str> = deliveries.iter().map(|(user, _)| user.as_str()).collect();
        let resolution = match self.registry.resolve(&users).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(message = %envelope.message_id, error = %e, "Resolve failed, skipping push");
                return 0;
            }
        };

        let mut per_node: HashMap<String, Vec<SessionDelivery>> = HashMap::new();
        for (user_id, record) in deliveries {
            let mut sessions = resolution.sessions_of(&user_id).peekable();
            if sessions.peek().is_none() {
                self.counters.offline.fetch_add(1, Ordering::Relaxed);
                debug!(user = %user_id, "Recipient offline, left for sync");
                continue;
            }
            for (session_id, node_id) in sessions {
                per_node
                    .entry(node_id.to_string())
                    .or_default()
                    .push(SessionDelivery {
                        session_id: session_id.to_string(),
                        user_id: user_id.clone(),
                        item: DeliveryItem {
                            scope: record.scope.clone(),
                            sequence: record.sequence,
                            envelope: envelope.clone(),
                        },
                    });
            }
        }

        let mut submitted = 0;
        for (node_id, deliveries) in per_node {
            let topic = self.keys.node_topic(&node_id);
            for payload in self.encode_notifications(&node_id, deliveries) {
                match self.pool.invoke(PublishJob::new(topic.clone(), payload)).await {
                    Ok(()) => {
                        submitted += 1;
                        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(node = %node_id, error = %e, "Failed to submit publish job");
                    }
                }
            }
        }
        submitted
    }

    /// Encode the deliveries bound for one node, halving batches until each
    /// notification fits in a frame.
    fn encode_notifications(&self, node_id: &str, deliveries: Vec<SessionDelivery>) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        let mut pending = vec![deliveries];

        while let Some(batch) = pending.pop() {
            let frame = Frame::Notify {
                node_id: node_id.to_string(),
                deliveries: batch,
            };
            match codec::encode(&frame) {
                Ok(payload) => payloads.push(payload),
                Err(ProtocolError::FrameTooLarge(size)) => match frame {
                    Frame::Notify { mut deliveries, .. } if deliveries.len() > 1 => {
                        trace!(node = %node_id, size, batch = deliveries.len(), "Splitting notification");
                        let tail = deliveries.split_off(deliveries.len() / 2);
                        pending.push(tail);
                        pending.push(deliveries);
                    }
                    _ => {
                        self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(node = %node_id, size, "Single delivery exceeds frame limit, dropped");
                    }
                },
                Err(e) => {
                    self.counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(node = %node_id, error = %e, "Failed to encode notification");
                }
            }
        }
        payloads
    }

    /// Pull items of `scope` after `after` on behalf of `user_id`.
    ///
    /// A user may read their own inbox and the timeline of groups they
    /// belong to. `limit` is clamped to the configured batch size.
    ///
    /// # Errors
    ///
    /// [`CoreError::Forbidden`] for other scopes; store failures otherwise.
    pub async fn sync(
        &self,
        user_id: &str,
        scope: &Scope,
        after: u64,
        limit: usize,
    ) -> Result<Vec<DeliveryItem>> {
        self.authorize(user_id, scope).await?;
        let limit = limit.clamp(1, self.config.max_sync_batch.max(1));
        self.archive.range(scope, after, limit).await
    }

    /// Mark a message delivered on behalf of a recipient.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for unknown messages, [`CoreError::Forbidden`]
    /// if `user_id` is not a recipient.
    pub async fn acknowledge(&self, user_id: &str, message_id: &str) -> Result<()> {
        let envelope = self
            .archive
            .envelope(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;

        let scope = match envelope.kind {
            ConversationKind::Single => Scope::user(&envelope.recipient_id),
            ConversationKind::Group => Scope::group(&envelope.recipient_id),
        };
        self.authorize(user_id, &scope).await?;

        if envelope.status == MessageStatus::Sent {
            self.archive
                .set_status(message_id, MessageStatus::Delivered)
                .await?;
        }
        Ok(())
    }

    async fn authorize(&self, user_id: &str, scope: &Scope) -> Result<()> {
        let allowed = match scope {
            Scope::User(owner) => owner == user_id,
            Scope::Group(group_id) => self.directory.is_member(group_id, user_id).await?,
        };
        if allowed {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!("{user_id} cannot read {scope}")))
        }
    }
}
