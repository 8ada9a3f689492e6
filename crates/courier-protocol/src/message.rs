//! Message envelope and delivery types shared between nodes and clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Conversation kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ConversationKind {
    /// Direct user-to-user message.
    Single = 1,
    /// Message addressed to a group.
    Group = 2,
}

impl From<ConversationKind> for u8 {
    fn from(kind: ConversationKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for ConversationKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ConversationKind::Single),
            2 => Ok(ConversationKind::Group),
            _ => Err("Invalid conversation kind"),
        }
    }
}

/// Delivery status of a message. The only envelope field that changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageStatus {
    #[default]
    Sent = 0,
    Delivered = 1,
    Read = 2,
}

impl From<MessageStatus> for u8 {
    fn from(status: MessageStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for MessageStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageStatus::Sent),
            1 => Ok(MessageStatus::Delivered),
            2 => Ok(MessageStatus::Read),
            _ => Err("Invalid message status"),
        }
    }
}

/// A sequence scope: one inbox whose ordering is tracked by one counter.
///
/// Rendered as `u:<user>` or `g:<group>` on the wire and in storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    /// A single user's inbox.
    User(String),
    /// A group's own timeline.
    Group(String),
}

impl Scope {
    /// Inbox of a user.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Scope::User(id.into())
    }

    /// Timeline of a group.
    #[must_use]
    pub fn group(id: impl Into<String>) -> Self {
        Scope::Group(id.into())
    }

    /// The user or group id behind this scope.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Scope::User(id) | Scope::Group(id) => id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::User(id) => write!(f, "u:{id}"),
            Scope::Group(id) => write!(f, "g:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, id) = s.split_once(':').ok_or("Scope is missing its kind prefix")?;
        if id.is_empty() {
            return Err("Scope id cannot be empty");
        }
        match tag {
            "u" => Ok(Scope::User(id.to_string())),
            "g" => Ok(Scope::Group(id.to_string())),
            _ => Err("Unknown scope kind"),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> String {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// An immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique message id.
    pub message_id: String,
    /// Sending user.
    pub sender_id: String,
    /// Recipient user or group.
    pub recipient_id: String,
    /// Single or group conversation.
    pub kind: ConversationKind,
    /// Application-defined content type tag.
    pub content_type: u32,
    /// Opaque payload.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// Delivery status.
    #[serde(default)]
    pub status: MessageStatus,
    /// Mentioned users, group messages only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// One sequenced copy of a message inside a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryItem {
    /// Scope the sequence number belongs to.
    pub scope: Scope,
    /// Sequence number within `scope`.
    pub sequence: u64,
    /// The message.
    pub envelope: Envelope,
}

/// A delivery addressed to one live session on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDelivery {
    /// Target session.
    pub session_id: String,
    /// Owner of the session.
    pub user_id: String,
    /// The sequenced message.
    pub item: DeliveryItem,
}
