//! In-process [`Broker`] built on tokio broadcast channels.

use super::{Broker, Subscription};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

/// Default per-topic buffer.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Broker for a single process; also records how often each topic was hit.
#[derive(Debug)]
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    published: DashMap<String, u64>,
    capacity: usize,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a broker whose topics buffer `capacity` payloads per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            published: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of payloads published to `topic` so far.
    #[must_use]
    pub fn published_count(&self, topic: &str) -> u64 {
        self.published.get(topic).map_or(0, |n| *n)
    }

    /// Total payloads published across all topics.
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.published.iter().map(|n| *n.value()).sum()
    }

    /// Live subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        *self.published.entry(topic.to_string()).or_insert(0) += 1;

        let receivers = self
            .topics
            .get(topic)
            .map(|tx| tx.send(payload).unwrap_or_default())
            .unwrap_or(0);
        trace!(topic = %topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = topic.to_string();
        Ok(BroadcastStream::new(rx)
            .filter_map(move |item| {
                let topic = topic.clone();
                async move {
                    match item {
                        Ok(payload) => Some(payload),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Subscriber lagged, payloads dropped");
                            None
                        }
                    }
                }
            })
            .boxed())
    }
}
