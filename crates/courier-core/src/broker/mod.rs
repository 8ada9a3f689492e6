//! Publish/subscribe fabric between nodes.
//!
//! Every node subscribes to its own topic (see
//! [`Keyspace::node_topic`](crate::store::Keyspace::node_topic)) and the
//! router publishes delivery batches there. Brokers are at-least-once and
//! make no ordering promise across producers.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// A stream of payloads published to one topic.
pub type Subscription = BoxStream<'static, Bytes>;

/// A topic-keyed message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an opaque payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a topic. The subscription ends when the stream is dropped.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}
