//! Bounded retry with exponential backoff.
//!
//! Wraps one remote operation in a retry loop that only spends attempts on
//! classifier-retryable failures (rate limiting). Everything else, including
//! permission and validation failures, propagates on the first occurrence.
//! The delay before attempt n is `initial_delay * multiplier^(n-2)`; a
//! server-provided retry-after hint can lengthen, never shorten, a delay.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetrySpec;
use crate::error::{RemoteError, Result};

/// Retry policy applied to one remote operation at a time.
///
/// Stateless; one instance is shared across all calls of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum executions, first attempt included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Factor applied for each later attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a new policy.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// Builds a policy from the config-file settings.
    #[must_use]
    pub fn from_spec(spec: &RetrySpec) -> Self {
        Self {
            max_attempts: spec.max_attempts.max(1),
            initial_delay: Duration::from_millis(spec.initial_delay_ms),
            backoff_multiplier: spec.backoff_multiplier,
        }
    }

    /// Returns the backoff delay before the given 1-based attempt, or
    /// `None` for the first attempt.
    #[must_use]
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < 2 {
            return None;
        }
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        Some(
            self.initial_delay
                .mul_f64(self.backoff_multiplier.powi(exponent)),
        )
    }
}

/// Merges the computed backoff with a server-provided hint.
///
/// The hint can only lengthen the wait; honoring a shorter hint would defeat
/// the exponential ramp.
fn effective_delay(policy: &RetryPolicy, next_attempt: u32, hint_secs: Option<u64>) -> Duration {
    let computed = policy
        .delay_before_attempt(next_attempt)
        .unwrap_or_default();
    match hint_secs {
        Some(secs) => computed.max(Duration::from_secs(secs)),
        None => computed,
    }
}

/// Executes `operation` under the given policy.
///
/// # Errors
///
/// Propagates non-retryable errors immediately. When every attempt is
/// consumed by retryable failures, returns
/// [`RemoteError::RetriesExhausted`] wrapping the final error so its
/// classification survives for the fallback loop.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                let delay = effective_delay(policy, attempt + 1, error.retry_delay_secs());
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) if error.is_retryable() => {
                warn!(operation, attempts = attempt, "retry policy exhausted");
                return Err(RemoteError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                }
                .into());
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, SyncError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited() -> SyncError {
        SyncError::Remote(RemoteError::RateLimited {
            retry_after_secs: None,
        })
    }

    fn fatal() -> SyncError {
        SyncError::Remote(RemoteError::Unauthorized {
            message: String::from("bad token"),
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), 2.0)
    }

    #[test]
    fn test_delay_formula() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before_attempt(1), None);
        assert_eq!(policy.delay_before_attempt(2), Some(Duration::from_millis(2000)));
        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_millis(4000)));
        assert_eq!(policy.delay_before_attempt(4), Some(Duration::from_millis(8000)));
    }

    #[test]
    fn test_delays_monotonic() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (2..6)
            .map(|n| policy.delay_before_attempt(n).unwrap())
            .collect();
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_server_hint_only_lengthens() {
        let policy = RetryPolicy::default();
        // Hint above the computed 2s backoff wins
        assert_eq!(
            effective_delay(&policy, 2, Some(10)),
            Duration::from_secs(10)
        );
        // Hint below the computed 4s backoff is ignored
        assert_eq!(
            effective_delay(&policy, 3, Some(1)),
            Duration::from_secs(4)
        );
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_policy(&fast_policy(3), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u32> = retry_with_policy(&fast_policy(3), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(fatal())
            }
        })
        .await;

        assert_eq!(result.unwrap_err().class(), ErrorClass::Unauthorized);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_policy(&fast_policy(3), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(rate_limited())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reported_distinctly() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u32> = retry_with_policy(&fast_policy(3), "op", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(rate_limited())
            }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match &error {
            SyncError::Remote(RemoteError::RetriesExhausted { attempts, .. }) => {
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        // The final attempt's classification survives the wrapper
        assert_eq!(error.class(), ErrorClass::RateLimited);
    }
}
