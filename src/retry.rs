//! Bounded exponential-backoff retry
//!
//! [`RetryExecutor`] wraps any asynchronous operation. Transient failures are retried after a
//! deterministic, capped exponential wait; anything else is returned at once without spending the
//! remaining attempts. The executor holds nothing but a copy of the policy, so a single instance
//! can drive any number of concurrent operations.
use crate::config::RetryPolicy;
use crate::error::{TransportError, error_chain, is_retryable_message};
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, error, warn};

/// Decides whether a failure is worth another attempt.
pub trait Classify {
    fn is_retryable(&self) -> bool;
}

impl Classify for TransportError {
    fn is_retryable(&self) -> bool {
        TransportError::is_retryable(self)
    }
}

impl Classify for anyhow::Error {
    fn is_retryable(&self) -> bool {
        match self.downcast_ref::<TransportError>() {
            Some(transport) => transport.is_retryable(),
            None => is_retryable_message(&format!("{self:#}")),
        }
    }
}

impl Classify for Box<dyn std::error::Error + Send + Sync> {
    fn is_retryable(&self) -> bool {
        match self.downcast_ref::<TransportError>() {
            Some(transport) => transport.is_retryable(),
            None => is_retryable_message(&error_chain(self.as_ref())),
        }
    }
}

impl Classify for String {
    fn is_retryable(&self) -> bool {
        is_retryable_message(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or runs out of
    /// attempts. The error returned is always the one produced by the last attempt.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        if !self.policy.enabled {
            return operation().await;
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!(attempt = attempt + 1, error = %error, "Non-retryable error, giving up");
                return Err(error);
            }

            if attempt + 1 >= max_attempts {
                error!(attempts = max_attempts, error = %error, "Request failed after all attempts");
                return Err(error);
            }

            let wait = self.policy.backoff_delay(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "Request attempt failed, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    fn executor(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_until_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), TransportError> = executor(5)
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::from_message("request timeout"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            result.unwrap_err(),
            TransportError::Retryable("request timeout".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_backoff_schedule() {
        let started = Instant::now();
        let attempt_times = Arc::new(Mutex::new(Vec::new()));

        let _: Result<(), TransportError> = executor(5)
            .run(|| {
                let attempt_times = Arc::clone(&attempt_times);
                async move {
                    attempt_times.lock().await.push(started.elapsed());
                    Err(TransportError::from_message("connection refused"))
                }
            })
            .await;

        let times = attempt_times.lock().await.clone();
        let waits: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [2000, 4000, 8000, 16000].map(Duration::from_millis);

        assert_eq!(waits.len(), expected.len());
        for (actual, expected) in waits.iter().zip(expected) {
            assert!(
                *actual >= expected && *actual < expected + Duration::from_millis(5),
                "waited {actual:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: Result<(), TransportError> = executor(5)
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::from_message("invalid request"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = executor(3)
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::from_message("service unavailable"))
                    } else {
                        Ok("loaded")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disabled_policy_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy {
            enabled: false,
            ..RetryPolicy::default()
        });

        let result: Result<(), String> = executor
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("timeout".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anyhow_errors_are_classified_by_chain() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), anyhow::Error> = executor(2)
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("connection reset by peer").context("embedding call"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
