//! Retry budget and exponential backoff for provider calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transient provider failures.
///
/// Attempts are numbered from 1. A request gets one initial attempt plus up
/// to `max_retries` retries; after failed attempt `n` the worker sleeps
/// `retry_delay_ms * 2^(n-1)`, capped at `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub retry_delay_ms: u64,
    /// Upper bound on any single backoff, in milliseconds (0 = uncapped).
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            max_backoff_ms: 0,
        }
    }

    /// Total attempts a request may consume.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Backoff to apply after failed attempt `attempt`, in milliseconds.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exponent = (attempt - 1).min(32);
        let delay = self.retry_delay_ms.saturating_mul(1u64 << exponent);
        if self.max_backoff_ms > 0 {
            delay.min(self.max_backoff_ms)
        } else {
            delay
        }
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 1s initial backoff, 30s cap.
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, 1_000);
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(1), 1_000);
        assert_eq!(policy.backoff_ms(2), 2_000);
        assert_eq!(policy.backoff_ms(3), 4_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            retry_delay_ms: 500,
            max_backoff_ms: 3_000,
        };
        assert_eq!(policy.backoff_ms(3), 2_000);
        assert_eq!(policy.backoff_ms(4), 3_000);
        assert_eq!(policy.backoff_ms(9), 3_000);
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(100, u64::MAX / 2);
        assert_eq!(policy.backoff_ms(60), u64::MAX);
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::new(3, 10);
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        let none = RetryPolicy::new(0, 10);
        assert!(!none.should_retry(1));
    }
}
