//! Scorer health tracking.
//!
//! Individual scorer failures are "no decision" for one window. A run of
//! consecutive failures means detection is effectively off, which operators
//! must see.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Transition reported by [`ScorerHealth::record_failure`] / `record_success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Unchanged,
    /// Failure count just reached the threshold.
    Degraded,
    /// First success after being degraded.
    Recovered,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthSnapshot {
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub threshold: u32,
}

/// Shared, lock-free counter of consecutive scorer failures.
#[derive(Debug, Clone)]
pub struct ScorerHealth {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    threshold: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl ScorerHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                threshold: threshold.max(1),
                consecutive_failures: AtomicU32::new(0),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    pub fn record_success(&self) -> HealthChange {
        self.inner.consecutive_failures.store(0, Ordering::SeqCst);
        if self.inner.degraded.swap(false, Ordering::SeqCst) {
            HealthChange::Recovered
        } else {
            HealthChange::Unchanged
        }
    }

    pub fn record_failure(&self) -> HealthChange {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.inner.threshold && !self.inner.degraded.swap(true, Ordering::SeqCst) {
            HealthChange::Degraded
        } else {
            HealthChange::Unchanged
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            degraded: self.is_degraded(),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::SeqCst),
            threshold: self.inner.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_once_at_threshold() {
        let health = ScorerHealth::new(3);
        assert_eq!(health.record_failure(), HealthChange::Unchanged);
        assert_eq!(health.record_failure(), HealthChange::Unchanged);
        assert_eq!(health.record_failure(), HealthChange::Degraded);
        assert_eq!(health.record_failure(), HealthChange::Unchanged);
        assert!(health.is_degraded());
        assert_eq!(health.snapshot().consecutive_failures, 4);
    }

    #[test]
    fn test_success_recovers() {
        let health = ScorerHealth::new(1);
        assert_eq!(health.record_failure(), HealthChange::Degraded);
        assert_eq!(health.record_success(), HealthChange::Recovered);
        assert_eq!(health.record_success(), HealthChange::Unchanged);
        assert!(!health.is_degraded());
    }

    #[test]
    fn test_intermittent_failures_do_not_degrade() {
        let health = ScorerHealth::new(2);
        health.record_failure();
        health.record_success();
        assert_eq!(health.record_failure(), HealthChange::Unchanged);
        assert!(!health.is_degraded());
    }
}
