//! Codec for encoding and decoding Courier frames.
//!
//! MessagePack serialization with a 4-byte length prefix. The same framing is
//! used on client WebSockets and for broker notification payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

fn serialize(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    Ok(body)
}

/// Reads the length prefix, if enough bytes are present, and bounds-checks it.
fn body_length(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(length))
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = serialize(frame)?;
    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(())
}

/// Decode exactly one frame from the start of `data`.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let length = body_length(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;

    let end = LENGTH_PREFIX_SIZE + length;
    if data.len() < end {
        return Err(ProtocolError::Incomplete(end - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..end])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(None)` while the buffer holds less than one full frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(length) = body_length(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ConversationKind, DeliveryItem, Envelope, MessageStatus, Scope, SessionDelivery};

    fn sample_item() -> DeliveryItem {
        DeliveryItem {
            scope: Scope::user("u1"),
            sequence: 1,
            envelope: Envelope {
                message_id: "m-1".to_string(),
                sender_id: "u2".to_string(),
                recipient_id: "u1".to_string(),
                kind: ConversationKind::Single,
                content_type: 1,
                body: b"hello".to_vec(),
                status: MessageStatus::Sent,
                mentions: Vec::new(),
                created_at: 1_700_000_000_000,
            },
        }
    }

    #[test]
    fn test_notify_frame_survives_codec() {
        let frame = Frame::Notify {
            node_id: "n1".to_string(),
            deliveries: vec![SessionDelivery {
                session_id: "s1".to_string(),
                user_id: "u1".to_string(),
                item: sample_item(),
            }],
        };

        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_unit_and_push_frames_survive_codec() {
        for frame in [
            Frame::Disconnect,
            Frame::push_group(3, "g1", b"hey".to_vec()),
            Frame::connected("s1", "n1", 1, 30_000),
        ] {
            assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::heartbeat(1);
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let frame = Frame::push_direct(1, "u1", vec![0u8; MAX_FRAME_SIZE + 1]);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::heartbeat(1);
        let frame2 = Frame::Deliver { item: sample_item() };

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();
        // Trailing partial frame stays buffered.
        buf.extend_from_slice(&[0, 0]);

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }
}
