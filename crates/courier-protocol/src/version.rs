//! Protocol version negotiation.
//!
//! Versions are a single byte on the wire. A node accepts any client version
//! in `MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION` and answers with the lower
//! of the two.

use std::fmt;

/// Current protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest client version still accepted.
pub const MIN_SUPPORTED_VERSION: u8 = 1;

/// A client version outside the supported window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedVersion(pub u8);

impl fmt::Display for UnsupportedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol version {} unsupported (accepted {}..={})",
            self.0, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION
        )
    }
}

impl std::error::Error for UnsupportedVersion {}

/// Pick the version to speak with a client that offered `offered`.
///
/// # Errors
///
/// Returns [`UnsupportedVersion`] if the client is older than
/// [`MIN_SUPPORTED_VERSION`].
pub fn negotiate(offered: u8) -> Result<u8, UnsupportedVersion> {
    if offered < MIN_SUPPORTED_VERSION {
        return Err(UnsupportedVersion(offered));
    }
    Ok(offered.min(PROTOCOL_VERSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_current() {
        assert_eq!(negotiate(PROTOCOL_VERSION), Ok(PROTOCOL_VERSION));
    }

    #[test]
    fn test_negotiate_newer_client_downgrades() {
        assert_eq!(negotiate(PROTOCOL_VERSION + 3), Ok(PROTOCOL_VERSION));
    }

    #[test]
    fn test_negotiate_rejects_too_old() {
        assert_eq!(negotiate(0), Err(UnsupportedVersion(0)));
        assert!(negotiate(0).unwrap_err().to_string().contains("unsupported"));
    }
}
