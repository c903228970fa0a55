//! Cluster adapters -- execute mutation intents against the platform.

pub mod kube;

pub use self::kube::KubeClusterAdapter;

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::orchestrator::{IdempotencyKey, IntentParams, MutationIntent, SubsetWeight};

/// Successful application of an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub key: IdempotencyKey,
    /// The key had been applied before; nothing was changed.
    pub already_applied: bool,
}

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ApplyError {
    pub reason: String,
    /// Transient failures (network, conflict, throttling) may succeed on a
    /// later attempt; anything else will not.
    pub retryable: bool,
}

impl ApplyError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Executes intents. Implementations must be safe to call twice with the
/// same idempotency key.
#[async_trait::async_trait]
pub trait ClusterAdapter: Send + Sync {
    async fn reweight_route(
        &self,
        target: &str,
        route: &str,
        host: &str,
        weights: &[SubsetWeight],
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError>;

    async fn scale_deployment(
        &self,
        target: &str,
        deployment: &str,
        replicas: u32,
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError>;

    async fn apply(&self, intent: &MutationIntent) -> Result<Ack, ApplyError> {
        match &intent.params {
            IntentParams::ReweightRoute {
                route,
                host,
                weights,
            } => {
                self.reweight_route(&intent.target, route, host, weights, &intent.key)
                    .await
            }
            IntentParams::ScaleDeployment {
                deployment,
                replicas,
            } => {
                self.scale_deployment(&intent.target, deployment, *replicas, &intent.key)
                    .await
            }
        }
    }
}

/// Idempotency keys an adapter has already applied.
///
/// Only the keys of each target's latest report are kept. The orchestrator
/// never issues intents for a report once a newer one has been accepted for
/// the same target, so older keys can no longer come back.
#[derive(Debug, Default)]
pub struct AppliedKeys {
    by_target: Mutex<HashMap<String, ReportKeys>>,
}

#[derive(Debug, Default)]
struct ReportKeys {
    report: String,
    keys: HashSet<IdempotencyKey>,
}

impl AppliedKeys {
    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        self.by_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key.target())
            .is_some_and(|r| r.keys.contains(key))
    }

    pub fn insert(&self, key: &IdempotencyKey) {
        let mut by_target = self.by_target.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = by_target.entry(key.target().to_string()).or_default();
        if entry.report != key.report() {
            entry.report = key.report().to_string();
            entry.keys.clear();
        }
        entry.keys.insert(key.clone());
    }

    pub fn len(&self) -> usize {
        self.by_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| r.keys.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Adapter that only logs what it would do.
#[derive(Debug, Default)]
pub struct DryRunAdapter {
    applied: AppliedKeys,
}

impl DryRunAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn ack(&self, key: &IdempotencyKey) -> Option<Ack> {
        if self.applied.contains(key) {
            return Some(Ack {
                key: key.clone(),
                already_applied: true,
            });
        }
        None
    }

    fn record(&self, key: &IdempotencyKey) -> Ack {
        self.applied.insert(key);
        Ack {
            key: key.clone(),
            already_applied: false,
        }
    }
}

#[async_trait::async_trait]
impl ClusterAdapter for DryRunAdapter {
    async fn reweight_route(
        &self,
        target: &str,
        route: &str,
        host: &str,
        weights: &[SubsetWeight],
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        if let Some(ack) = self.ack(key) {
            return Ok(ack);
        }
        let split: Vec<String> = weights
            .iter()
            .map(|w| format!("{}={}", w.subset, w.weight))
            .collect();
        info!(service = %target, route, host, weights = %split.join(","), key = %key, "[dry-run] reweight route");
        Ok(self.record(key))
    }

    async fn scale_deployment(
        &self,
        target: &str,
        deployment: &str,
        replicas: u32,
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        if let Some(ack) = self.ack(key) {
            return Ok(ack);
        }
        info!(service = %target, deployment, replicas, key = %key, "[dry-run] scale deployment");
        Ok(self.record(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::failover_intents;
    use crate::report::ReportId;
    use crate::target::Target;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_dry_run_honors_idempotency_keys() {
        let adapter = DryRunAdapter::new();
        let report = ReportId::for_window("ratings", Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap());
        let intents = failover_intents(&Target::new("ratings"), &report);

        for intent in &intents {
            let ack = adapter.apply(intent).await.unwrap();
            assert!(!ack.already_applied);
            assert_eq!(ack.key, intent.key);
        }
        for intent in &intents {
            assert!(adapter.apply(intent).await.unwrap().already_applied);
        }
        assert_eq!(adapter.applied.len(), 2);
    }

    #[test]
    fn test_applied_keys_keep_only_latest_report_per_target() {
        let applied = AppliedKeys::default();
        let at = |m| Utc.with_ymd_and_hms(2025, 5, 1, 12, m, 0).unwrap();
        let first = ReportId::for_window("ratings", at(0));
        let second = ReportId::for_window("ratings", at(10));
        let reviews = ReportId::for_window("reviews", at(0));

        for intent in failover_intents(&Target::new("ratings"), &first)
            .iter()
            .chain(&failover_intents(&Target::new("reviews"), &reviews))
        {
            applied.insert(&intent.key);
        }
        assert_eq!(applied.len(), 4);

        let newer = failover_intents(&Target::new("ratings"), &second);
        applied.insert(&newer[0].key);

        assert_eq!(applied.len(), 3);
        assert!(applied.contains(&newer[0].key));
        assert!(!applied.contains(&failover_intents(&Target::new("ratings"), &first)[0].key));
        // Other targets keep theirs.
        assert!(applied.contains(&failover_intents(&Target::new("reviews"), &reviews)[1].key));
    }
}
