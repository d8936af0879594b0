//! Caller-side retry for commands that lost an optimistic concurrency race.
//!
//! The pipeline never retries on its own: a conflicting command may need to
//! be re-evaluated against fresh state, and only the caller knows whether
//! that is safe. Wrap the call in [`retry_on_conflict`] when it is.
//!
//! ```rust,ignore
//! let outcome = retry_on_conflict(&RetryConfig::default(), &RetryPolicy::default(), || {
//!     pipeline.handle(Deposit { account: "42".into(), amount: 10 })
//! })
//! .await?;
//! ```

use crate::errors::{CommandError, CommandResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// [`backoff`](Self::backoff) with up to 25% random jitter added.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let jitter = rand::rng().random_range(0.0..=0.25);
        delay.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

/// Which errors are worth another attempt.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Only revision conflicts.
    #[default]
    ConflictsOnly,
    /// Revision conflicts and transient log failures.
    ConflictsAndTransient,
    /// A user-defined predicate.
    Custom(fn(&CommandError) -> bool),
}

impl RetryPolicy {
    /// Whether `error` should trigger a retry.
    pub fn should_retry(&self, error: &CommandError) -> bool {
        match self {
            Self::ConflictsOnly => error.is_conflict(),
            Self::ConflictsAndTransient => {
                error.is_conflict() || matches!(error, CommandError::Log(e) if e.is_transient())
            }
            Self::Custom(predicate) => predicate(error),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
///
/// The last error is returned unchanged when attempts are exhausted.
pub async fn retry_on_conflict<T, F, Fut>(
    config: &RetryConfig,
    policy: &RetryPolicy,
    mut operation: F,
) -> CommandResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CommandResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "command succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts && policy.should_retry(&err) => {
                let delay = config.jittered_backoff(attempt);
                debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying command"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if attempt > 1 {
                    warn!(attempt, error = %err, "giving up on command");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EventLogError;
    use crate::types::StreamId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> CommandError {
        CommandError::RevisionConflict {
            stream: StreamId::try_new("s").unwrap(),
            expected: "exactly 0".into(),
            actual: None,
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(350));
        assert_eq!(config.backoff(40), Duration::from_millis(350));
        assert!(config.jittered_backoff(2) >= Duration::from_millis(200));
        assert!(config.jittered_backoff(2) <= Duration::from_millis(250));
    }

    #[test]
    fn policies_classify_errors() {
        let transient = CommandError::Log(EventLogError::Unavailable("down".into()));
        assert!(RetryPolicy::ConflictsOnly.should_retry(&conflict()));
        assert!(!RetryPolicy::ConflictsOnly.should_retry(&transient));
        assert!(RetryPolicy::ConflictsAndTransient.should_retry(&transient));
        assert!(!RetryPolicy::ConflictsAndTransient.should_retry(&CommandError::Cancelled));
        assert!(RetryPolicy::Custom(|e| matches!(e, CommandError::Cancelled))
            .should_retry(&CommandError::Cancelled));
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&fast(), &RetryPolicy::default(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_the_last_error() {
        let calls = AtomicU32::new(0);
        let result: CommandResult<()> =
            retry_on_conflict(&fast(), &RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: CommandResult<()> =
            retry_on_conflict(&fast(), &RetryPolicy::default(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CommandError::business_rule("insufficient funds"))
            })
            .await;

        assert!(matches!(result, Err(CommandError::BusinessRule(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
