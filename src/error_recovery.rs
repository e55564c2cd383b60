//! Automatic error recovery strategies.
//!
//! Only connection-management operations are retried automatically. Capture and
//! set operations touch the physical sample, so repeating them without domain
//! knowledge is unsafe; the dispatcher surfaces those failures directly.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation with bounded exponential backoff.
///
/// The delay before retry `n` (1-based) is
/// `min(initial_backoff * multiplier^(n-1), max_backoff)`.
///
/// # Example
///
/// ```rust
/// use tera_daq::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     initial_backoff: Duration::from_millis(200),
///     multiplier: 2.0,
///     max_backoff: Duration::from_secs(5),
/// };
/// assert_eq!(policy.delay_for(3), Duration::from_millis(800));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Total attempts will be `max_attempts + 1` (the initial try is not counted).
    /// Set to 0 to disable retries.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Growth factor applied to the delay after every failed retry.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    /// Creates a default retry policy.
    ///
    /// Default policy attempts 3 retries starting at 100ms, doubling, capped at 2s.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tera_daq::error_recovery::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.max_attempts, 3);
    /// assert_eq!(policy.initial_backoff, Duration::from_millis(100));
    /// ```
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry as i32 - 1);
        let millis = self.initial_backoff.as_secs_f64() * 1000.0 * factor;
        let capped = millis.min(self.max_backoff.as_secs_f64() * 1000.0);
        Duration::from_micros((capped * 1000.0) as u64)
    }
}

/// Runs `operation` and retries it according to `policy` while it fails with a
/// retryable error kind.
///
/// Non-retryable failures are returned immediately. When the retry budget is
/// exhausted the last error is returned unchanged, so a connection failure stays
/// a [`DaqError::Connection`](crate::error::DaqError::Connection).
///
/// # Example
///
/// ```rust,ignore
/// let handle = retry_with_backoff(&policy, "connect", || async {
///     instrument.connect().await.map_err(|e| DaqError::connection("source", e))
/// })
/// .await?;
/// ```
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut retry = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if retry > 0 {
                    debug!(label = %label, retries = retry, "Operation recovered");
                }
                return Ok(value);
            }
            Err(err) if err.kind().is_retryable() && retry < policy.max_attempts => {
                retry += 1;
                let delay = policy.delay_for(retry);
                warn!(
                    label = %label,
                    error = %err,
                    retry,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaqError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_logic_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = retry_with_backoff(&fast_policy(3), "connect", || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 2 {
                    Ok(n)
                } else {
                    Err(DaqError::connection("source", "refused"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(logs_contain("Retrying after failure"));
    }

    #[tokio::test]
    async fn test_retry_logic_fails_after_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: AppResult<()> = retry_with_backoff(&fast_policy(3), "connect", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaqError::connection("source", "refused"))
            }
        })
        .await;
        assert!(matches!(result, Err(DaqError::Connection { .. })));
        // initial try + 3 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_acquisition_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: AppResult<()> = retry_with_backoff(&fast_policy(5), "capture", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaqError::acquisition("source", "no trace"))
            }
        })
        .await;
        assert!(matches!(result, Err(DaqError::Acquisition { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
