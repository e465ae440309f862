//! Retry policy with exponential backoff.
//!
//! The policy re-runs an attempt while it fails with a retryable kind
//! (`RateLimited` or `ProviderUnavailable`), sleeping
//! `base_delay * multiplier^(attempt - 1)` (capped at `max_delay`) between
//! attempts, up to `max_attempts`. Any other failure is returned at once.
//!
//! # Usage
//!
//! ```ignore
//! use docmeta_llm::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! let outcome = policy
//!     .run(None, |_attempt| async { adapter.complete(&request).await })
//!     .await;
//! println!("finished after {} attempts", outcome.attempts);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::dispatcher::StopSignal;
use crate::error::LlmError;
use crate::model_config::RetryConfig;
use crate::traits::CompletionResult;

/// Anything the policy can inspect for a failure.
pub trait AttemptOutcome {
    fn failure(&self) -> Option<&LlmError>;
}

impl AttemptOutcome for CompletionResult {
    fn failure(&self) -> Option<&LlmError> {
        self.error()
    }
}

impl<T> AttemptOutcome for Result<T, LlmError> {
    fn failure(&self) -> Option<&LlmError> {
        self.as_ref().err()
    }
}

/// Final outcome of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// Outcome of the last attempt.
    pub value: T,
    /// Attempts made, including the last one.
    pub attempts: u32,
}

/// Exponential backoff over retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    log_retries: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            log_retries: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max_delay: Duration::from_millis(config.max_delay_ms),
            log_retries: true,
        }
    }

    /// Policy that does not log retries.
    pub fn silent(mut self) -> Self {
        self.log_retries = false;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable kind,
    /// the attempt ceiling is reached, or `stop` is raised.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, stop: Option<&StopSignal>, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        T: AttemptOutcome,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let value = operation(attempt).await;

            let retryable = match value.failure() {
                None => {
                    if attempt > 1 && self.log_retries {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return RetryOutcome {
                        value,
                        attempts: attempt,
                    };
                }
                Some(e) if !e.is_retryable() => {
                    if self.log_retries {
                        debug!("Error is non-retryable, stopping: {}", e);
                    }
                    false
                }
                Some(e) if attempt >= self.max_attempts => {
                    if self.log_retries {
                        warn!(
                            "Operation failed after {} attempts, giving up: {}",
                            attempt, e
                        );
                    }
                    false
                }
                Some(_) if stop.is_some_and(StopSignal::is_stopped) => {
                    if self.log_retries {
                        info!("Stop requested, not retrying after attempt {}", attempt);
                    }
                    false
                }
                Some(e) => {
                    let delay = self.delay_for(attempt);
                    if self.log_retries {
                        warn!(
                            "Attempt {}/{} failed ({}), retrying in {:?}: {}",
                            attempt,
                            self.max_attempts,
                            e.code(),
                            delay,
                            e
                        );
                    }
                    sleep(delay).await;
                    true
                }
            };

            if !retryable {
                return RetryOutcome {
                    value,
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .silent()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_succeeds_first_time() {
        let outcome = fast_policy(3)
            .run(None, |_| async { Ok::<_, LlmError>(42) })
            .await;
        assert_eq!(outcome.value.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let outcome = fast_policy(3)
            .run(None, |_| {
                let count = call_count_clone.clone();
                async move {
                    let attempts = count.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempts < 3 {
                        Err(LlmError::RateLimited("429".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.value.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let outcome = fast_policy(4)
            .run(None, |_| {
                let count = call_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(LlmError::ProviderUnavailable("always fails".to_string()))
                }
            })
            .await;

        assert!(matches!(
            outcome.value,
            Err(LlmError::ProviderUnavailable(_))
        ));
        assert_eq!(outcome.attempts, 4);
        assert_eq!(call_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stops_on_permanent_error() {
        for error in [
            LlmError::AuthError("invalid".to_string()),
            LlmError::ConfigError("unknown model".to_string()),
            LlmError::ValidationError("not json".to_string()),
        ] {
            let call_count = Arc::new(AtomicU32::new(0));
            let call_count_clone = call_count.clone();
            let outcome = fast_policy(5)
                .run(None, |_| {
                    let count = call_count_clone.clone();
                    let error = error.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err::<i32, _>(error)
                    }
                })
                .await;

            assert_eq!(outcome.attempts, 1);
            assert_eq!(call_count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_passed() {
        let mut seen = Vec::new();
        let outcome = fast_policy(3)
            .run(None, |attempt| {
                seen.push(attempt);
                async { Err::<i32, _>(LlmError::RateLimited("429".to_string())) }
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_signal_prevents_retry() {
        let stop = StopSignal::new();
        stop.stop();
        let outcome = fast_policy(5)
            .run(Some(&stop), |_| async {
                Err::<i32, _>(LlmError::RateLimited("429".to_string()))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    }
}
