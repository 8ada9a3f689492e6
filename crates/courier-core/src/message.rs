//! Outbound message requests and envelope construction.

use crate::error::{CoreError, Result};
use courier_protocol::{ConversationKind, Envelope, MessageStatus, Scope};
use std::time::{SystemTime, UNIX_EPOCH};

/// A globally unique message identifier.
pub type MessageId = String;

/// Generate a globally unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message a sender asks the router to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Authenticated sender.
    pub sender_id: String,
    /// Recipient user or group.
    pub recipient_id: String,
    /// Single or group conversation.
    pub kind: ConversationKind,
    /// Content type tag.
    pub content_type: u32,
    /// Opaque payload.
    pub body: Vec<u8>,
    /// Mentioned users.
    pub mentions: Vec<String>,
}

impl OutboundMessage {
    /// A direct message.
    #[must_use]
    pub fn direct(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sender_id: sender.into(),
            recipient_id: recipient.into(),
            kind: ConversationKind::Single,
            content_type: 0,
            body: body.into(),
            mentions: Vec::new(),
        }
    }

    /// A group message.
    #[must_use]
    pub fn group(
        sender: impl Into<String>,
        group: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            kind: ConversationKind::Group,
            ..Self::direct(sender, group, body)
        }
    }

    /// Set the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: u32) -> Self {
        self.content_type = content_type;
        self
    }

    /// Set the mentioned users.
    #[must_use]
    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    /// The scope whose sequence is reported back to the sender: the
    /// recipient inbox for direct messages, the group timeline otherwise.
    #[must_use]
    pub fn primary_scope(&self) -> Scope {
        match self.kind {
            ConversationKind::Single => Scope::user(&self.recipient_id),
            ConversationKind::Group => Scope::group(&self.recipient_id),
        }
    }

    /// Check the request before any sequence is allocated.
    ///
    /// # Errors
    ///
    /// [`CoreError::Invalid`] on empty ids, an oversized body, or mentions on
    /// a direct message.
    pub fn validate(&self, max_body: usize) -> Result<()> {
        if self.sender_id.is_empty() {
            return Err(CoreError::Invalid("sender cannot be empty".into()));
        }
        if self.recipient_id.is_empty() {
            return Err(CoreError::Invalid("recipient cannot be empty".into()));
        }
        if self.body.len() > max_body {
            return Err(CoreError::Invalid(format!(
                "body of {} bytes exceeds limit {max_body}",
                self.body.len()
            )));
        }
        if self.kind == ConversationKind::Single && !self.mentions.is_empty() {
            return Err(CoreError::Invalid(
                "mentions are only allowed in group messages".into(),
            ));
        }
        Ok(())
    }

    /// Freeze the request into an envelope with a fresh id.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        Envelope {
            message_id: generate_message_id(),
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            kind: self.kind,
            content_type: self.content_type,
            body: self.body,
            status: MessageStatus::Sent,
            mentions: self.mentions,
            created_at: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_and_group_scopes() {
        let direct = OutboundMessage::direct("u2", "u1", b"hi".to_vec());
        assert_eq!(direct.primary_scope(), Scope::user("u1"));

        let group = OutboundMessage::group("u2", "g1", b"hi".to_vec());
        assert_eq!(group.kind, ConversationKind::Group);
        assert_eq!(group.primary_scope(), Scope::group("g1"));
    }

    #[test]
    fn test_validation() {
        let ok = OutboundMessage::direct("u2", "u1", b"hi".to_vec());
        assert!(ok.validate(16).is_ok());
        assert!(ok.validate(1).is_err());

        let no_recipient = OutboundMessage::direct("u2", "", b"hi".to_vec());
        assert!(no_recipient.validate(16).is_err());

        let mentions = OutboundMessage::direct("u2", "u1", b"hi".to_vec())
            .with_mentions(vec!["u3".into()]);
        assert!(mentions.validate(16).is_err());
        let group_mentions =
            OutboundMessage::group("u2", "g1", b"hi".to_vec()).with_mentions(vec!["u3".into()]);
        assert!(group_mentions.validate(16).is_ok());
    }

    #[test]
    fn test_envelope_has_unique_id_and_sent_status() {
        let a = OutboundMessage::direct("u2", "u1", b"hi".to_vec()).into_envelope();
        let b = OutboundMessage::direct("u2", "u1", b"hi".to_vec())
            .with_content_type(3)
            .into_envelope();

        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.status, MessageStatus::Sent);
        assert_eq!(b.content_type, 3);
        assert!(a.created_at > 0);
    }
}
