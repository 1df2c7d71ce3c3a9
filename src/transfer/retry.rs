//! Retry with backoff for store calls
//!
//! Each unit of work (a part upload, a whole-object put or get, a listing
//! page) retries locally under a [`RetryPolicy`]; retries never span units.
//! Every attempt races the invocation's cancellation token and, when the
//! policy sets one, a per-call timeout. A timed-out attempt counts as a
//! transient failure against the same budget.
//!
//! # Example
//!
//! ```no_run
//! use stowage::transfer::retry::{with_retry, Operation, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> stowage::Result<()> {
//! let policy = RetryPolicy::default();
//! let cancel = CancellationToken::new();
//! let value = with_retry(&policy, &cancel, Operation::new("head_object", "bucket", "key"), |_| async {
//!     Ok::<_, stowage::TransferError>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TransferError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,

    /// Timeout for a single attempt
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
            call_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy for network-flaky scenarios
    pub fn network() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
            ..Default::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Calculate delay for a given attempt number
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.checked_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => 2_u32
                .checked_pow(attempt - 1)
                .and_then(|multiplier| self.initial_delay.checked_mul(multiplier)),
            BackoffStrategy::Fixed => Some(self.initial_delay),
        };

        let capped_delay = base_delay.unwrap_or(self.max_delay).min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter) && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            capped_delay + Duration::from_secs_f64(capped_delay.as_secs_f64() * jitter)
        } else {
            capped_delay
        }
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    ExponentialWithJitter,
}

/// What is being retried, for logs and error context
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub name: &'static str,
    pub bucket: &'a str,
    pub key: &'a str,
}

impl<'a> Operation<'a> {
    pub fn new(name: &'static str, bucket: &'a str, key: &'a str) -> Self {
        Self { name, bucket, key }
    }
}

/// Final failure of a retried call
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub error: TransferError,
    pub attempts: u32,
}

impl Exhausted {
    /// Error with operation context attached; cancellation stays bare
    pub fn into_error(self, op: Operation<'_>) -> TransferError {
        if matches!(self.error, TransferError::Cancelled) {
            return self.error;
        }
        let context = format!(
            "{} {}/{} failed after {} attempt(s)",
            op.name, op.bucket, op.key, self.attempts
        );
        self.error.context(context)
    }
}

async fn attempt_once<Fut, T>(timeout: Option<Duration>, call: Fut, op: Operation<'_>) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransferError::TransientNetwork(format!(
                "{} {}/{} timed out after {:?}",
                op.name, op.bucket, op.key, limit
            ))),
        },
    }
}

/// Execute an operation with retry, reporting the attempt count on failure
///
/// `operation` receives the 1-based attempt number.
pub async fn retry_with_attempts<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: Operation<'_>,
    mut operation: F,
) -> std::result::Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(Exhausted {
                error: TransferError::Cancelled,
                attempts: attempt - 1,
            });
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            outcome = attempt_once(policy.call_timeout, operation(attempt), op) => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} {}/{} succeeded on attempt {}", op.name, op.bucket, op.key, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempt >= max_attempts || !error.is_retryable() {
            return Err(Exhausted {
                error,
                attempts: attempt,
            });
        }

        let delay = policy.calculate_delay(attempt);
        warn!(
            "{} {}/{} attempt {}/{} failed, retrying in {:?}: {}",
            op.name, op.bucket, op.key, attempt, max_attempts, delay, error
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Exhausted {
                    error: TransferError::Cancelled,
                    attempts: attempt,
                })
            }
            _ = sleep(delay) => {}
        }
    }
}

/// Execute an operation with retry logic
///
/// Failures other than cancellation carry operation, bucket, key and attempt
/// count as context.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: Operation<'_>,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_attempts(policy, cancel, op, operation)
        .await
        .map_err(|exhausted| exhausted.into_error(op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Exponential,
            jitter_factor: 0.0,
            call_timeout: None,
        }
    }

    fn op() -> Operation<'static> {
        Operation::new("put_object", "bucket", "key")
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_max_delay_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.calculate_delay(10), Duration::from_secs(5));
        // Overflowing multipliers saturate at the cap
        assert_eq!(policy.calculate_delay(64), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(linear.calculate_delay(3), Duration::from_millis(300));

        let fixed = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Fixed,
            ..Default::default()
        };
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = with_retry(&fast_policy(3), &cancel, op(), |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TransferError::TransientNetwork("reset".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_fails_immediately() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = with_retry(&fast_policy(5), &cancel, op(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TransferError::AccessDenied("no".to_string())) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts_with_context() {
        let cancel = CancellationToken::new();

        let err = with_retry(&fast_policy(3), &cancel, op(), |_| async {
            Err::<(), _>(TransferError::TransientNetwork("transient".to_string()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientNetwork);
        assert!(err
            .to_string()
            .starts_with("put_object bucket/key failed after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn test_attempt_numbers_passed_through() {
        let cancel = CancellationToken::new();
        let exhausted = retry_with_attempts(&fast_policy(4), &cancel, op(), |attempt| async move {
            Err::<(), _>(TransferError::TransientNetwork(format!("attempt {}", attempt)))
        })
        .await
        .unwrap_err();

        assert_eq!(exhausted.attempts, 4);
        assert!(exhausted.error.to_string().contains("attempt 4"));
    }

    #[tokio::test]
    async fn test_call_timeout_is_transient_and_retried() {
        let attempts = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let policy = fast_policy(2).with_call_timeout(Duration::from_millis(10));

        let exhausted = retry_with_attempts(&policy, &cancel, op(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(exhausted.error.kind(), ErrorKind::TransientNetwork);
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);

        let err = with_retry(&fast_policy(3), &cancel, op(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::Fixed,
            ..Default::default()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = with_retry(&policy, &cancel, op(), |_| async {
            Err::<(), _>(TransferError::TransientNetwork("down".to_string()))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
