use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Errors that know whether a repeat attempt could succeed.
///
/// Implemented by each outbound client's error type; server overload and
/// unavailability classes are retryable, everything else aborts at once.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Capped exponential backoff with jitter, applied explicitly at every
/// outbound call site rather than inside the HTTP clients.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before retry number `retry` (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^retry, max_delay) + random_jitter(0..base_delay)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_ms.min(self.max_delay.as_millis() as u64);
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt ceiling is reached. Returns the last error in the
    /// latter two cases.
    pub async fn run<F, Fut, T, E>(&self, what: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let total_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retryable() || attempt >= total_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for_retry(attempt - 1);
                    tracing::warn!(
                        "{}: retryable error (attempt {}/{}), retrying in {}ms: {}",
                        what,
                        attempt,
                        total_attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
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

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
        msg: &'static str,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn instant(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        };
        let d = policy.delay_for_retry(0);
        assert!(d >= Duration::from_secs(2) && d < Duration::from_secs(4));
        let d = policy.delay_for_retry(2);
        assert!(d >= Duration::from_secs(8) && d < Duration::from_secs(10));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        };
        let d = policy.delay_for_retry(10);
        assert!(d >= Duration::from_secs(30) && d < Duration::from_secs(35));
    }

    #[test]
    fn test_delay_zero_base() {
        assert_eq!(instant(3).delay_for_retry(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let result: Result<i32, TestError> = instant(3).run("op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_abort_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, TestError> = instant(5)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError {
                        retryable: false,
                        msg: "forbidden",
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap_err().msg, "forbidden");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, TestError> = instant(5)
            .run("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError {
                            retryable: true,
                            msg: "503",
                        })
                    } else {
                        Ok(99)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<i32, TestError> = instant(3)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError {
                        retryable: true,
                        msg: "still overloaded",
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap_err().msg, "still overloaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
