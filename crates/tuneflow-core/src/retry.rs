//! Bounded-attempt retry with backoff for flaky network operations.
//!
//! Every retried call site (registry registration, registry version lookup,
//! OCI image pull/push, secret retrieval, server termination) goes through
//! [`RetryPolicy::execute`]; call sites differ only in attempt count and delay.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `delay_ms * attempt` before the retry following `attempt`.
    Linear { delay_ms: u64 },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Linear { delay_ms } => {
                Duration::from_millis(delay_ms.saturating_mul(u64::from(attempt)))
            }
        }
    }
}

/// Error surfaced once every attempt has failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// The error returned by the final attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Retry configuration for one call site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// Linearly growing delay between attempts.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear {
                delay_ms: base_delay.as_millis() as u64,
            },
        }
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// Each failure is logged with the attempt number and cause. After
    /// `max_attempts` consecutive failures the last error is returned
    /// wrapped in [`RetryError::Exhausted`]. No delay follows the final attempt.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: &str,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(operation, |_| true, op).await
    }

    /// Like [`execute`](Self::execute), but only errors accepted by
    /// `retryable` are retried. Any other error ends the loop at once and is
    /// returned as the last error.
    pub async fn execute_if<R, F, Fut, T, E>(
        &self,
        operation: &str,
        retryable: R,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        R: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retry = retryable(&err);
                    warn!(
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        retryable = retry,
                        error = %err,
                        "attempt failed"
                    );
                    if !retry || attempt >= max_attempts {
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: err,
                        });
                    }
                    tokio::time::sleep(self.backoff.delay_after(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_policy_is_three_attempts_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.backoff.delay_after(2), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_backoff_grows_with_attempt() {
        let backoff = Backoff::Linear { delay_ms: 100 };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = policy
            .execute("flaky", move || {
                let c = counter.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(format!("failure {}", n + 1))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_exhausts_after_max_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = policy
            .execute("always", move || {
                let c = counter.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last_error(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_fixed_delay_between_attempts_only() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let start = tokio::time::Instant::now();

        let _: Result<(), RetryError<String>> = policy
            .execute("timed", || async { Err("nope".to_string()) })
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = policy
            .execute_if(
                "selective",
                |e: &String| e.starts_with("transient"),
                move || {
                    let c = counter.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Err("transient reset".to_string())
                        } else {
                            Err("malformed payload".to_string())
                        }
                    }
                },
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert_eq!(err.into_last_error(), "malformed payload");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let _: Result<(), RetryError<String>> = policy
            .execute("once", move || {
                let c = counter.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("x".to_string())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
