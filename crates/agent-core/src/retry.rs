//! Retry logic with exponential backoff
//!
//! This module provides utilities for retrying operations with configurable
//! retry policies and exponential backoff. Both event transport calls and
//! agent execution go through [`RetryPolicy::execute`].

use agent_utils::RetrySettings;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that know whether another attempt may succeed
pub trait Retryable {
    /// Check if an error is retryable
    fn is_retryable(&self) -> bool;
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            backoff_multiplier: settings.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(0),
            max_backoff: Duration::from_secs(0),
            backoff_multiplier: 1.0,
        }
    }

    /// Create a policy with fast retries (for testing)
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate backoff duration before the given retry attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_secs(0);
        }

        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let backoff = Duration::from_millis(backoff_ms as u64);

        // Cap at max backoff
        if backoff > self.max_backoff {
            self.max_backoff
        } else {
            backoff
        }
    }

    /// Execute an async operation with retry logic
    ///
    /// Returns the first success, the first non-retryable error, or the last
    /// error once `max_attempts` calls have failed. The number of calls made
    /// is returned alongside the outcome.
    pub async fn execute<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Debug,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "Attempt {}/{} for operation: {}",
                attempt, max_attempts, operation_name
            );

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            "Operation '{}' succeeded after {} retries",
                            operation_name,
                            attempt - 1
                        );
                    }
                    return Attempted {
                        attempts: attempt,
                        result: Ok(result),
                    };
                }
                Err(e) => {
                    if !e.is_retryable() {
                        debug!(
                            "Operation '{}' failed with non-retryable error",
                            operation_name
                        );
                        return Attempted {
                            attempts: attempt,
                            result: Err(e),
                        };
                    }

                    if attempt >= max_attempts {
                        warn!(
                            "Operation '{}' failed after {} attempts: {:?}",
                            operation_name, attempt, e
                        );
                        return Attempted {
                            attempts: attempt,
                            result: Err(e),
                        };
                    }

                    let backoff = self.backoff_duration(attempt);
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {:?}. Retrying in {:?}",
                        operation_name, attempt, max_attempts, e, backoff
                    );
                    sleep(backoff).await;
                }
            }
        }
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct Attempted<T, E> {
    /// Number of calls made
    pub attempts: u32,
    /// Final outcome
    pub result: Result<T, E>,
}

impl<T, E> Attempted<T, E> {
    /// Drop the attempt count
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_attempts: 0,
            initial_backoff_ms: 5,
            max_backoff_ms: 50,
            backoff_multiplier: 3.0,
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_backoff, Duration::from_millis(5));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(15));
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_duration(0), Duration::from_secs(0));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_execute_success_after_retry() {
        let policy = RetryPolicy::fast();
        let attempt_count = Arc::new(Mutex::new(0));
        let count = attempt_count.clone();

        let outcome = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    let mut current = count.lock().await;
                    *current += 1;
                    if *current < 2 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, Ok(42));
        assert_eq!(*attempt_count.lock().await, 2);
    }

    #[tokio::test]
    async fn test_execute_all_attempts_fail() {
        let policy = RetryPolicy::fast();
        let attempt_count = Arc::new(Mutex::new(0));
        let count = attempt_count.clone();

        let outcome = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    *count.lock().await += 1;
                    Err::<i32, _>(TestError::Flaky)
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.into_result(), Err(TestError::Flaky));
        assert_eq!(*attempt_count.lock().await, 3);
    }

    #[tokio::test]
    async fn test_execute_non_retryable_error() {
        let policy = RetryPolicy::fast();
        let attempt_count = Arc::new(Mutex::new(0));
        let count = attempt_count.clone();

        let outcome = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    *count.lock().await += 1;
                    Err::<i32, _>(TestError::Broken)
                }
            })
            .await;

        assert_eq!(outcome.result, Err(TestError::Broken));
        assert_eq!(*attempt_count.lock().await, 1); // Should not retry
    }
}
