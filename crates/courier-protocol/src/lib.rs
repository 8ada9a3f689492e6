//! # courier-protocol
//!
//! Wire protocol for the Courier messaging core.
//!
//! Clients talk to a node with [`Frame`]s over WebSocket; nodes hand
//! deliveries to each other by publishing [`Frame::Notify`] on the broker.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` / `Disconnect` - Session lifecycle
//! - `Heartbeat` / `HeartbeatAck` - Liveness renewal
//! - `Push` / `PushAck` - Send a message, receive its id and sequence
//! - `Sync` / `SyncBatch` - Pull an inbox after a sequence number
//! - `Deliver` / `Ack` - Server push and client receipt
//! - `Notify` - Node-to-node delivery batch
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{Frame, codec};
//!
//! let frame = Frame::push_direct(1, "bob", b"Hello, Bob!".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod message;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use message::{ConversationKind, DeliveryItem, Envelope, MessageStatus, Scope, SessionDelivery};
pub use version::{negotiate, UnsupportedVersion, PROTOCOL_VERSION};
