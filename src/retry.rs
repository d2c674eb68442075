//! Shared retry policy (§4.13 step 5-6), used by the tool executor and
//! available to provider drivers that want the same backoff shape.
//!
//! Grounded in the teacher's `failsafe::retry` pattern (a policy struct plus
//! a `with_retry` free function and an `is_retryable` classifier) but the
//! backoff itself is computed by hand against the specification's explicit
//! formula rather than through a backoff crate, since the teacher's own
//! `Cargo.toml` and `retry.rs` disagree on which one (`backon` vs
//! `backoff`) is actually in use.

use std::time::Duration;

use crate::error::Error;

/// Exponential backoff with a cap, matching §4.13 step 5:
/// `initial_delay * backoff^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are attempted at all.
    pub enabled: bool,
    /// Maximum number of attempts, including the first (default 3).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Multiplicative backoff factor applied per attempt.
    pub backoff: f64,
    /// Substrings that classify a failure as retryable (§4.13 step 6).
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: 2.0,
            retryable_patterns: Error::default_retryable_patterns(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `attempt`th retry (1-indexed: `attempt=1` is the
    /// delay before the second overall try).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Classify an error as retryable per §4.13 step 6.
    #[must_use]
    pub fn is_retryable(&self, error: &Error) -> bool {
        error.matches_any_pattern(&self.retryable_patterns)
    }
}

/// Outcome of a retried operation, carrying the attempt count observed
/// (§8 P6: `retry_count=K`).
pub struct RetryOutcome<T> {
    /// The final value on success.
    pub value: T,
    /// Number of retries performed (0 if it succeeded on the first try).
    pub retry_count: u32,
}

/// Run `f` under `policy`, sleeping between retryable failures per the
/// capped-exponential schedule, and returning the final error if the
/// attempt budget is exhausted or a non-retryable error is hit.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Result<RetryOutcome<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let max_attempts = if policy.enabled { policy.max_attempts.max(1) } else { 1 };
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(RetryOutcome { value, retry_count: attempt }),
            Err(e) => {
                attempt += 1;
                let exhausted = attempt >= max_attempts;
                if exhausted || !policy.is_retryable(&e) {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: 2.0,
            max_delay: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300)); // capped from 400
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_k_retryable_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 5,
            ..Default::default()
        };
        let outcome = with_retry(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::ToolCallFailed("connection refused".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.retry_count, 2);
    }

    #[tokio::test]
    async fn with_retry_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<RetryOutcome<()>, Error> = with_retry(&policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ToolNotFound("x".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_fails_after_exhausting_max_attempts() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<RetryOutcome<()>, Error> = with_retry(&policy, || async {
            Err(Error::ToolCallFailed("timeout".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
