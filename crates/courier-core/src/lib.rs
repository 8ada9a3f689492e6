//! # courier-core
//!
//! Presence, sequencing and routing for the Courier messaging cluster.
//!
//! This crate provides the building blocks shared by every node:
//!
//! - **Store** - atomic primitives over the shared key-value store
//! - **Presence** - session to node registry with heartbeat expiry
//! - **Sequence** - strictly increasing sequence numbers per scope
//! - **Archive** - durable envelopes and per-scope delivery records
//! - **Router** - sequence, persist, resolve and dispatch a message
//! - **Pool** - bounded workers publishing to the broker
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│   Archive   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!              ┌─────────────┐ ┌─────────────┐     ┌─────────────┐
//!              │  Presence   │ │ PublishPool │────▶│   Broker    │
//!              └─────────────┘ └─────────────┘     └─────────────┘
//!                        │
//!                        ▼
//!                 ┌─────────────┐
//!                 │  KeyStore   │
//!                 └─────────────┘
//! ```

pub mod archive;
pub mod broker;
pub mod directory;
pub mod error;
pub mod message;
pub mod pool;
pub mod presence;
pub mod retry;
pub mod router;
pub mod sequence;
pub mod store;

pub use archive::{DeliveryRecord, MemoryArchive, MessageArchive};
pub use broker::{Broker, MemoryBroker, Subscription};
pub use directory::{GroupDirectory, StoreDirectory};
pub use error::{BrokerError, CoreError, PoolError, Result, StoreError};
pub use message::OutboundMessage;
pub use pool::{PoolConfig, PoolStats, PublishJob, PublishPool};
pub use presence::{PresenceRegistry, Resolution, SessionId, DEFAULT_SESSION_TTL};
pub use retry::{retry_idempotent, with_deadline, RetryPolicy};
pub use router::{Accepted, PushReceipt, Router, RouterConfig, RouterParts, RouterStats};
pub use sequence::SequenceAllocator;
pub use store::{KeyStore, Keyspace, MemoryStore};

#[cfg(feature = "redis")]
pub use archive::RedisArchive;
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
#[cfg(feature = "redis")]
pub use store::RedisStore;
