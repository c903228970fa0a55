//! Per-target collection health.
//!
//! A target whose log cannot be read is not being monitored at all. One
//! failed cycle is skipped quietly; a run of them has to reach an operator.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::score::health::HealthChange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetCollection {
    pub consecutive_failures: u32,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorSnapshot {
    pub degraded: bool,
    pub threshold: u32,
    pub targets: BTreeMap<String, TargetCollection>,
}

#[derive(Debug)]
pub struct CollectorHealth {
    threshold: u32,
    targets: Mutex<BTreeMap<String, TargetCollection>>,
}

impl CollectorHealth {
    pub fn new(threshold: u32, targets: impl IntoIterator<Item = String>) -> Self {
        Self {
            threshold: threshold.max(1),
            targets: Mutex::new(
                targets
                    .into_iter()
                    .map(|t| (t, TargetCollection::default()))
                    .collect(),
            ),
        }
    }

    pub fn record_success(&self, target: &str) -> HealthChange {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = targets.entry(target.to_string()).or_default();
        entry.consecutive_failures = 0;
        if std::mem::take(&mut entry.degraded) {
            HealthChange::Recovered
        } else {
            HealthChange::Unchanged
        }
    }

    pub fn record_failure(&self, target: &str) -> HealthChange {
        let mut targets = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = targets.entry(target.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold && !entry.degraded {
            entry.degraded = true;
            HealthChange::Degraded
        } else {
            HealthChange::Unchanged
        }
    }

    pub fn failures(&self, target: &str) -> u32 {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .map_or(0, |t| t.consecutive_failures)
    }

    pub fn snapshot(&self) -> CollectorSnapshot {
        let targets = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        CollectorSnapshot {
            degraded: targets.values().any(|t| t.degraded),
            threshold: self.threshold,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(threshold: u32) -> CollectorHealth {
        CollectorHealth::new(threshold, ["ratings".to_string(), "reviews".to_string()])
    }

    #[test]
    fn test_degrades_each_target_once() {
        let health = health(2);
        assert_eq!(health.record_failure("ratings"), HealthChange::Unchanged);
        assert_eq!(health.record_failure("ratings"), HealthChange::Degraded);
        assert_eq!(health.record_failure("ratings"), HealthChange::Unchanged);
        assert_eq!(health.failures("ratings"), 3);

        let snap = health.snapshot();
        assert!(snap.degraded);
        assert!(snap.targets["ratings"].degraded);
        assert!(!snap.targets["reviews"].degraded);
    }

    #[test]
    fn test_success_recovers_target() {
        let health = health(1);
        assert_eq!(health.record_failure("reviews"), HealthChange::Degraded);
        assert_eq!(health.record_success("reviews"), HealthChange::Recovered);
        assert_eq!(health.record_success("reviews"), HealthChange::Unchanged);
        assert!(!health.snapshot().degraded);
    }
}
