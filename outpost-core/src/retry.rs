use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for queued mutations that fail with a transient error.
///
/// Each failed attempt doubles (by `backoff_multiplier`) the wait before the
/// entry is eligible again, up to `max_backoff_ms`. Once `max_attempts` is
/// reached the entry is moved out of the live queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts before giving up on an entry
    pub max_attempts: u32,

    /// Wait after the first failure, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound on the wait, in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier applied to the wait after each failure
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            backoff_multiplier,
        }
    }

    /// Policy that retries on every drain without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Wait required after `failures` failed attempts (1-indexed).
    pub fn backoff_duration(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(30) as i32;
        let backoff_ms = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// Earliest time an entry with `failures` attempts, last tried at
    /// `last_attempt`, may be tried again.
    pub fn next_attempt_at(&self, failures: u32, last_attempt: DateTime<Utc>) -> DateTime<Utc> {
        let wait = self.backoff_duration(failures);
        last_attempt + ChronoDuration::milliseconds(wait.as_millis() as i64)
    }

    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.initial_backoff_ms, 1_000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_backoff_duration_exponential() {
        let policy = RetryPolicy::new(5, 100, 10_000, 2.0);

        assert_eq!(policy.backoff_duration(0).as_millis(), 0);
        assert_eq!(policy.backoff_duration(1).as_millis(), 100);
        assert_eq!(policy.backoff_duration(2).as_millis(), 200);
        assert_eq!(policy.backoff_duration(3).as_millis(), 400);
    }

    #[test]
    fn test_backoff_duration_respects_max() {
        let policy = RetryPolicy::new(10, 100, 500, 2.0);
        assert_eq!(policy.backoff_duration(6).as_millis(), 500);
        assert_eq!(policy.backoff_duration(40).as_millis(), 500);
    }

    #[test]
    fn test_next_attempt_and_exhaustion() {
        let policy = RetryPolicy::new(3, 1_000, 60_000, 2.0);
        let last = Utc::now();
        assert_eq!(
            policy.next_attempt_at(2, last) - last,
            ChronoDuration::milliseconds(2_000)
        );
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert_eq!(RetryPolicy::immediate(3).backoff_duration(2), Duration::ZERO);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_is_bounded_and_non_decreasing(
                initial in 1u64..10_000,
                max in 1u64..600_000,
                multiplier in 1.0f64..4.0,
                failures in 1u32..64,
            ) {
                let policy = RetryPolicy::new(10, initial, max, multiplier);
                let current = policy.backoff_duration(failures);
                let next = policy.backoff_duration(failures + 1);
                prop_assert!(current.as_millis() <= max as u128);
                prop_assert!(next >= current);
            }
        }
    }
}
