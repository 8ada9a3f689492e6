//! Frame types for the Courier protocol.
//!
//! Frames are exchanged between clients and nodes over WebSocket, and
//! between nodes over the broker (`Notify`). Each frame is serialized
//! using MessagePack.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationKind, DeliveryItem, SessionDelivery};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Heartbeat = 0x03,
    HeartbeatAck = 0x04,
    Push = 0x05,
    PushAck = 0x06,
    Sync = 0x07,
    SyncBatch = 0x08,
    Deliver = 0x09,
    Ack = 0x0A,
    Error = 0x0B,
    Disconnect = 0x0C,
    Notify = 0x0D,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Heartbeat),
            0x04 => Ok(FrameType::HeartbeatAck),
            0x05 => Ok(FrameType::Push),
            0x06 => Ok(FrameType::PushAck),
            0x07 => Ok(FrameType::Sync),
            0x08 => Ok(FrameType::SyncBatch),
            0x09 => Ok(FrameType::Deliver),
            0x0A => Ok(FrameType::Ack),
            0x0B => Ok(FrameType::Error),
            0x0C => Ok(FrameType::Disconnect),
            0x0D => Ok(FrameType::Notify),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Malformed or unexpected frame.
    pub const BAD_REQUEST: u16 = 4000;
    /// Heartbeat arrived after the session expired; the client must reconnect.
    pub const SESSION_EXPIRED: u16 = 4001;
    /// Token rejected.
    pub const UNAUTHORIZED: u16 = 4003;
    /// Caller may not access the requested scope.
    pub const FORBIDDEN: u16 = 4004;
    /// Session id already bound to a node.
    pub const ALREADY_BOUND: u16 = 4009;
    /// Payload exceeds the configured size limit.
    pub const TOO_LARGE: u16 = 4013;
    /// Unclassified server failure.
    pub const INTERNAL: u16 = 5000;
    /// Shared store unreachable; retry with backoff.
    pub const UNAVAILABLE: u16 = 5003;
    /// Deadline exceeded; outcome unknown.
    pub const TIMEOUT: u16 = 5004;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Authentication token.
        token: String,
    },

    /// Session established.
    #[serde(rename = "connected")]
    Connected {
        /// Session id assigned by the node.
        session_id: String,
        /// Node serving the session.
        node_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Heartbeat interval in milliseconds the client must keep.
        heartbeat: u32,
    },

    /// Liveness renewal.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        /// Request ID.
        id: u64,
    },

    /// Heartbeat outcome.
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck {
        /// ID of the heartbeat.
        id: u64,
        /// False if the session had already expired.
        renewed: bool,
    },

    /// Send a message.
    #[serde(rename = "push")]
    Push {
        /// Request ID.
        id: u64,
        /// Recipient user or group id.
        recipient: String,
        /// Single or group conversation.
        kind: ConversationKind,
        /// Content type tag.
        content_type: u32,
        /// Opaque payload.
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
        /// Mentioned users.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mentions: Vec<String>,
    },

    /// Message accepted and persisted.
    #[serde(rename = "push_ack")]
    PushAck {
        /// ID of the push request.
        id: u64,
        /// Assigned message id.
        message_id: String,
        /// Sequence in the recipient scope (group scope for group messages).
        sequence: u64,
    },

    /// Pull messages from a scope after a sequence number.
    #[serde(rename = "sync")]
    Sync {
        /// Request ID.
        id: u64,
        /// Scope rendered as `u:<user>` or `g:<group>`.
        scope: String,
        /// Return sequences strictly greater than this.
        after: u64,
        /// Maximum items to return.
        limit: u32,
    },

    /// Response to a sync request.
    #[serde(rename = "sync_batch")]
    SyncBatch {
        /// ID of the sync request.
        id: u64,
        /// Scope queried.
        scope: String,
        /// Items in ascending sequence order.
        items: Vec<DeliveryItem>,
    },

    /// Server-initiated delivery to a live session.
    #[serde(rename = "deliver")]
    Deliver {
        /// The sequenced message.
        item: DeliveryItem,
    },

    /// Client acknowledges receipt of a message.
    #[serde(rename = "ack")]
    Ack {
        /// Request ID.
        id: u64,
        /// Acknowledged message.
        message_id: String,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Orderly session close.
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Node-to-node delivery notification carried over the broker.
    #[serde(rename = "notify")]
    Notify {
        /// Target node.
        node_id: String,
        /// Deliveries for sessions on that node.
        deliveries: Vec<SessionDelivery>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Heartbeat { .. } => FrameType::Heartbeat,
            Frame::HeartbeatAck { .. } => FrameType::HeartbeatAck,
            Frame::Push { .. } => FrameType::Push,
            Frame::PushAck { .. } => FrameType::PushAck,
            Frame::Sync { .. } => FrameType::Sync,
            Frame::SyncBatch { .. } => FrameType::SyncBatch,
            Frame::Deliver { .. } => FrameType::Deliver,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Disconnect => FrameType::Disconnect,
            Frame::Notify { .. } => FrameType::Notify,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: impl Into<String>) -> Self {
        Frame::Connect {
            version,
            token: token.into(),
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        session_id: impl Into<String>,
        node_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            session_id: session_id.into(),
            node_id: node_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Heartbeat frame.
    #[must_use]
    pub fn heartbeat(id: u64) -> Self {
        Frame::Heartbeat { id }
    }

    /// Create a new Push frame for a direct message.
    #[must_use]
    pub fn push_direct(id: u64, recipient: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Frame::Push {
            id,
            recipient: recipient.into(),
            kind: ConversationKind::Single,
            content_type: 0,
            body: body.into(),
            mentions: Vec::new(),
        }
    }

    /// Create a new Push frame for a group message.
    #[must_use]
    pub fn push_group(id: u64, group: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Frame::Push {
            id,
            recipient: group.into(),
            kind: ConversationKind::Group,
            content_type: 0,
            body: body.into(),
            mentions: Vec::new(),
        }
    }

    /// Create a new Sync frame.
    #[must_use]
    pub fn sync(id: u64, scope: impl Into<String>, after: u64, limit: u32) -> Self {
        Frame::Sync {
            id,
            scope: scope.into(),
            after,
            limit,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let connect = Frame::connect(1, "token");
        assert_eq!(connect.frame_type(), FrameType::Connect);

        let push = Frame::push_direct(1, "bob", b"hi".to_vec());
        assert_eq!(push.frame_type(), FrameType::Push);

        assert_eq!(Frame::Disconnect.frame_type(), FrameType::Disconnect);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x05), Ok(FrameType::Push));
        assert_eq!(FrameType::try_from(0x0D), Ok(FrameType::Notify));
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0x0E).is_err());
    }

    #[test]
    fn test_push_group_kind() {
        match Frame::push_group(7, "g1", b"x".to_vec()) {
            Frame::Push { kind, recipient, .. } => {
                assert_eq!(kind, ConversationKind::Group);
                assert_eq!(recipient, "g1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
