//! Node inbox listener.
//!
//! Subscribes to this node's broker topic and hands each delivery in an
//! incoming notification to the matching local session. When the
//! subscription ends (broker connection lost) it resubscribes with bounded
//! exponential backoff; deliveries published in the gap are recovered by
//! clients through sync.

use crate::metrics;
use crate::sessions::LocalSessions;
use courier_core::{Broker, BrokerError, Subscription};
use courier_protocol::{codec, Frame};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Subscribe to `topic` and spawn the delivery loop.
///
/// # Errors
///
/// Returns an error if the first subscription fails.
pub async fn spawn_inbox(
    broker: Arc<dyn Broker>,
    topic: String,
    node_id: String,
    sessions: LocalSessions,
) -> Result<JoinHandle<()>, BrokerError> {
    let subscription = broker.subscribe(&topic).await?;
    info!(topic = %topic, "Node inbox subscribed");

    Ok(tokio::spawn(async move {
        let mut subscription = subscription;
        loop {
            consume(&mut subscription, &node_id, &sessions).await;
            warn!(topic = %topic, "Node inbox subscription ended, resubscribing");
            subscription = resubscribe(broker.as_ref(), &topic).await;
        }
    }))
}

async fn consume(subscription: &mut Subscription, node_id: &str, sessions: &LocalSessions) {
    while let Some(payload) = subscription.next().await {
        match codec::decode(&payload) {
            Ok(Frame::Notify {
                node_id: target,
                deliveries,
            }) => {
                if target != node_id {
                    debug!(target = %target, "Notification for another node ignored");
                    continue;
                }
                for delivery in deliveries {
                    if sessions.deliver(delivery) {
                        metrics::record_delivery();
                    }
                }
            }
            Ok(other) => {
                warn!(frame_type = ?other.frame_type(), "Unexpected frame on node inbox");
            }
            Err(e) => {
                error!(error = %e, "Undecodable payload on node inbox");
            }
        }
    }
}

async fn resubscribe(broker: &dyn Broker, topic: &str) -> Subscription {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        match broker.subscribe(topic).await {
            Ok(subscription) => {
                info!(topic = %topic, "Node inbox resubscribed");
                return subscription;
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, backoff_ms = backoff.as_millis() as u64, "Resubscribe failed");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_core::MemoryBroker;
    use courier_core::SessionId;
    use courier_protocol::{
        ConversationKind, DeliveryItem, Envelope, MessageStatus, Scope, SessionDelivery,
    };

    fn notify(node: &str, session: &str, user: &str) -> Bytes {
        let frame = Frame::Notify {
            node_id: node.into(),
            deliveries: vec![SessionDelivery {
                session_id: session.into(),
                user_id: user.into(),
                item: DeliveryItem {
                    scope: Scope::user(user),
                    sequence: 4,
                    envelope: Envelope {
                        message_id: "m4".into(),
                        sender_id: "u2".into(),
                        recipient_id: user.into(),
                        kind: ConversationKind::Single,
                        content_type: 0,
                        body: b"hey".to_vec(),
                        status: MessageStatus::Sent,
                        mentions: Vec::new(),
                        created_at: 0,
                    },
                },
            }],
        };
        codec::encode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_notifications_reach_local_sessions() {
        let broker = Arc::new(MemoryBroker::new());
        let sessions = LocalSessions::new();
        let mut outbox = sessions.register(&SessionId::new("s1"), "u1");

        let handle = spawn_inbox(broker.clone(), "node:n1".into(), "n1".into(), sessions)
            .await
            .unwrap();

        broker.publish("node:n1", Bytes::from_static(b"junk")).await.unwrap();
        broker.publish("node:n1", notify("n2", "s1", "u1")).await.unwrap();
        broker.publish("node:n1", notify("n1", "s1", "u1")).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), outbox.recv())
            .await
            .unwrap()
            .unwrap();
        let Frame::Deliver { item } = frame else {
            panic!("expected a delivery");
        };
        assert_eq!(item.sequence, 4);
        assert!(outbox.try_recv().is_err());

        handle.abort();
    }
}
