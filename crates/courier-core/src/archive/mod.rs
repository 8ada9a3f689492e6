//! Durable message archive.
//!
//! Holds every envelope and its per-scope delivery records. The router
//! writes here before any network fan-out; clients recover missed pushes by
//! pulling a scope after the last sequence they saw.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use courier_protocol::{DeliveryItem, Envelope, MessageStatus, Scope};

pub use memory::MemoryArchive;
#[cfg(feature = "redis")]
pub use self::redis::RedisArchive;

/// One sequenced copy of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub scope: Scope,
    pub sequence: u64,
}

impl DeliveryRecord {
    #[must_use]
    pub fn new(scope: Scope, sequence: u64) -> Self {
        Self { scope, sequence }
    }
}

/// Storage for envelopes and delivery records.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Persist an envelope and all of its delivery records as one write.
    async fn store(&self, envelope: &Envelope, deliveries: &[DeliveryRecord]) -> Result<()>;

    /// Fetch an envelope with its current status.
    async fn envelope(&self, message_id: &str) -> Result<Option<Envelope>>;

    /// Delivery items of `scope` with sequence greater than `after`, ascending,
    /// at most `limit` of them.
    async fn range(&self, scope: &Scope, after: u64, limit: usize) -> Result<Vec<DeliveryItem>>;

    /// Highest persisted sequence of `scope`, 0 if empty.
    async fn max_sequence(&self, scope: &Scope) -> Result<u64>;

    /// Update the status of a stored message. Returns false if unknown.
    async fn set_status(&self, message_id: &str, status: MessageStatus) -> Result<bool>;
}
