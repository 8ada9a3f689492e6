//! Caller-side deadlines and retries.
//!
//! Store calls carry no timeout of their own. Callers bound them with
//! [`with_deadline`] and retry idempotent ones (heartbeat, resolve,
//! disconnect, sync) with [`retry_idempotent`]. `connect` and `push` are not
//! idempotent and must not be wrapped in a retry.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff for idempotent calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on a single delay.
    pub max_backoff: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Only [`CoreError::is_retryable`] errors are retried.
///
/// # Errors
///
/// The last error returned by `op`.
pub async fn retry_idempotent<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(attempts = attempt, error = %e, "Giving up after retries");
                }
                return Err(e);
            }
        }
    }
}

/// Bound `fut` by `deadline`.
///
/// # Errors
///
/// [`CoreError::Timeout`] if the deadline passes first; the side effect of
/// `fut` may or may not have happened.
pub async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| CoreError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            max_attempts: 5,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = retry_idempotent(&RetryPolicy::default(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoreError::StoreUnavailable("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_idempotent(&RetryPolicy::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::StoreUnavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(CoreError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_idempotent(&RetryPolicy::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Invalid("bad".into()))
        })
        .await;

        assert!(matches!(result, Err(CoreError::Invalid(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_timeout() {
        let result: Result<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CoreError::Timeout)));

        let result = with_deadline(Duration::from_millis(10), async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }
}
