//! Bounded exponential backoff shared by report delivery and cluster mutations.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule: `max_attempts` tries, doubling (by `multiplier`) the pause
/// between them from `initial_backoff_ms` up to `max_backoff_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Randomize each pause within [delay/2, delay].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy with fixed parameters and no jitter (handy in tests).
    pub fn fixed(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Pause to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0) as u64;

        if self.jitter && capped > 1 {
            let low = capped / 2;
            Duration::from_millis(rand::thread_rng().gen_range(low..=capped))
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            let full = RetryPolicy { jitter: false, ..policy.clone() }.delay(attempt);
            let d = policy.delay(attempt);
            assert!(d <= full && d >= full / 2, "attempt {}: {:?}", attempt, d);
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1), Duration::from_millis(1));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
