//! Error types for the Courier core.

use thiserror::Error;

/// Errors raised by a [`KeyStore`](crate::store::KeyStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("Store codec error: {0}")]
    Codec(String),

    /// The store answered with something unexpected.
    #[error("Store error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Errors surfaced by the registry, allocator, archive and dispatcher.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The session id already has a live mapping. Pick a new session id.
    #[error("Session already bound: {session}")]
    AlreadyBound {
        /// The conflicting session id.
        session: String,
    },

    /// A singular required lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient infrastructure failure. Callers may retry with backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Deadline exceeded. The side effect may or may not have happened.
    #[error("Deadline exceeded")]
    Timeout,

    /// Caller may not access the resource.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Caller supplied an invalid argument.
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether an idempotent call that failed with this error may be retried.
    ///
    /// `Timeout` is excluded: its outcome is unknown and the caller decides.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => CoreError::StoreUnavailable(msg),
            StoreError::Codec(msg) | StoreError::Internal(msg) => CoreError::Internal(msg),
        }
    }
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker handle was shut down.
    #[error("Broker closed")]
    Closed,
}

/// Publish pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been shut down and no longer accepts jobs.
    #[error("Publish pool closed")]
    Closed,
}

/// Convenience alias for core results.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let e: CoreError = StoreError::Unavailable("connection reset".into()).into();
        assert!(matches!(e, CoreError::StoreUnavailable(_)));
        assert!(e.is_retryable());

        let e: CoreError = StoreError::Codec("bad json".into()).into();
        assert!(matches!(e, CoreError::Internal(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_timeout_is_not_blindly_retryable() {
        assert!(!CoreError::Timeout.is_retryable());
        assert!(!CoreError::AlreadyBound {
            session: "s1".into()
        }
        .is_retryable());
    }
}
