//! Retry strategies with exponential backoff.
//!
//! Used for broker reconnection, for the requeue delay of transiently failing
//! commands, and by adapters that retry store operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Retry strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay (exponential backoff cap)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to prevent thundering herd
    pub use_jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Create a conservative retry strategy for critical operations
    pub const fn conservative() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            use_jitter: true,
        }
    }

    /// Create an aggressive retry strategy for non-critical operations
    pub const fn aggressive() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 3.0,
            use_jitter: false,
        }
    }

    /// Strategy without any delay, for tests.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            use_jitter: false,
        }
    }

    /// Calculate delay for a given attempt number
    ///
    /// Attempt `0` has no delay, attempt `1` waits `base_delay`, and each
    /// further attempt multiplies the delay up to `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let capped_delay = Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        if self.use_jitter {
            add_jitter(capped_delay)
        } else {
            capped_delay
        }
    }
}

/// Add random jitter to prevent thundering herd effect
fn add_jitter(delay: Duration) -> Duration {
    let jitter_factor = rand::rng().random_range(0.8..1.2);
    delay.mul_f64(jitter_factor)
}

/// Errors that can occur during retry operations
#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display> {
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries, last error: {last_error}")]
    ExhaustedAttempts {
        /// Number of attempts made
        attempts: u32,
        /// The last error encountered
        last_error: E,
    },

    /// Non-retryable error encountered
    #[error("non-retryable error: {0}")]
    NonRetryable(E),
}

impl<E: std::fmt::Display> RetryError<E> {
    /// The underlying error, whichever way the retry loop ended.
    pub fn into_inner(self) -> E {
        match self {
            Self::ExhaustedAttempts { last_error, .. } | Self::NonRetryable(last_error) => {
                last_error
            }
        }
    }
}

/// Execute an operation with retry logic
///
/// `is_retryable` classifies each failure; a non-retryable failure ends the
/// loop immediately.
pub async fn retry_operation<F, Fut, T, E, R>(
    strategy: &RetryStrategy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + std::fmt::Debug,
    R: Fn(&E) -> bool,
{
    let max_attempts = strategy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt, "operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(error) if !is_retryable(&error) => {
                warn!(operation = operation_name, error = %error, "operation failed with non-retryable error");
                return Err(RetryError::NonRetryable(error));
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryError::ExhaustedAttempts {
                    attempts: attempt,
                    last_error: error,
                });
            }
            Err(error) => {
                let delay = strategy.calculate_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
