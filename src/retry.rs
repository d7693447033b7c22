//! Retry policy for external driver calls.
//!
//! Transient driver errors and per-attempt timeouts are retried with capped
//! exponential backoff. Rate-limit responses abort the loop immediately so
//! the caller can re-seed the pacing bucket and defer the whole job instead
//! of burning attempts in place.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::drivers::{DriverError, DriverResult};

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64
            * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            let offset = rand::random::<f64>() * range * 2.0 - range;
            (clamped + offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

/// Why a retried call gave up.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: DriverError },

    /// The driver returned a permanent error; no further attempts made.
    #[error(transparent)]
    NonRetryable(DriverError),

    /// The backend rate-limited us; the caller should defer.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
}

/// Run `op` under `policy`, with each attempt bounded by `attempt_timeout`.
/// A timed-out attempt counts as transient.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    label: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DriverResult<T>>,
{
    let mut last = DriverError::Retryable("no attempts made".into());
    for attempt in 1..=policy.max_attempts {
        let result = tokio::time::timeout(attempt_timeout, op(attempt)).await;
        match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(DriverError::RateLimited { retry_after })) => {
                debug!(label, attempt, ?retry_after, "driver rate limited");
                return Err(RetryError::RateLimited { retry_after });
            }
            Ok(Err(err)) if err.is_retryable() => {
                debug!(label, attempt, error = %err, "transient driver error");
                last = err;
            }
            Ok(Err(err)) => return Err(RetryError::NonRetryable(err)),
            Err(_) => {
                debug!(label, attempt, timeout_ms = attempt_timeout.as_millis() as u64, "attempt timed out");
                last = DriverError::Retryable(format!("timed out after {attempt_timeout:?}"));
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }
    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            ..Default::default()
        }
        .with_jitter(0.0);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        }
        .with_jitter(0.0)
    }

    #[tokio::test]
    async fn succeeds_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_call(&fast_policy(), Duration::from_secs(1), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DriverError::Retryable("flaky".into()))
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
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_call(&fast_policy(), Duration::from_secs(1), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DriverError::Retryable("always down".into())) }
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry_call(&fast_policy(), Duration::from_secs(1), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DriverError::NonRetryable("bad request".into())) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::NonRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_aborts_with_hint() {
        let result: Result<(), _> =
            retry_call(&fast_policy(), Duration::from_secs(1), "test", |_| async {
                Err(DriverError::RateLimited {
                    retry_after: Some(Duration::from_secs(2)),
                })
            })
            .await;
        match result {
            Err(RetryError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_call(
            &fast_policy(),
            Duration::from_millis(10),
            "test",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Exhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
