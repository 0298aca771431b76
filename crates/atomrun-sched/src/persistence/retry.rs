//! Bounded exponential backoff for transient job store failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SchedError, SchedResult};

/// Retry budget for transient job store errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Run `op`, retrying transient failures according to `policy`.
///
/// Non-transient errors are returned immediately. When the budget is spent
/// the last transient error is wrapped in `StoreUnavailable`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> SchedResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    return Err(SchedError::StoreUnavailable {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = &AtomicU32::new(0);
        let result = retry_transient(&RetryPolicy::default(), "get_record", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SchedError::StoreTransient("busy".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let calls = &AtomicU32::new(0);
        let result: SchedResult<()> =
            retry_transient(&RetryPolicy::default(), "add_record", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedError::StoreTransient("connection refused".into()))
            })
            .await;

        assert!(matches!(
            result,
            Err(SchedError::StoreUnavailable { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_logical_errors_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: SchedResult<()> =
            retry_transient(&RetryPolicy::default(), "update_record", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedError::not_found("calc", "job-a"))
            })
            .await;

        assert!(matches!(result, Err(SchedError::RecordNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
