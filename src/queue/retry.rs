use std::time::Duration;

use super::Message;
use crate::errors::TaskError;

/// Decides whether a failed message goes back on the queue.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, message: &Message, error: &TaskError) -> bool;

    fn next_retry_delay(&self, message: &Message) -> Duration;
}

/// Doubles the delay on every attempt, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialBackoff {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        let base_delay = if base_delay.is_zero() {
            Duration::from_secs(1)
        } else {
            base_delay
        };
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, message: &Message, error: &TaskError) -> bool {
        error.is_retryable() && message.retry_count < self.max_retries
    }

    fn next_retry_delay(&self, message: &Message) -> Duration {
        // Integer milliseconds: day-sized bases with large counts must saturate.
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let delay_ms = 2u128
            .checked_pow(message.retry_count)
            .and_then(|factor| base_ms.checked_mul(factor))
            .map_or(max_ms, |delay| delay.min(max_ms));
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }
}

/// Retries with the same delay every time.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearRetry {
    max_retries: u32,
    delay: Duration,
}

impl LinearRetry {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl RetryPolicy for LinearRetry {
    fn should_retry(&self, message: &Message, error: &TaskError) -> bool {
        error.is_retryable() && message.retry_count < self.max_retries
    }

    fn next_retry_delay(&self, _message: &Message) -> Duration {
        self.delay
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _message: &Message, _error: &TaskError) -> bool {
        false
    }

    fn next_retry_delay(&self, _message: &Message) -> Duration {
        Duration::ZERO
    }
}
