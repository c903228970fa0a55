//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use meshguard::alert::AlertManager;
use meshguard::analysis::{Window, WindowFeatures};
use meshguard::cluster::{Ack, ApplyError, ClusterAdapter};
use meshguard::orchestrator::{IdempotencyKey, Orchestrator, SubsetWeight};
use meshguard::report::AnomalyReport;
use meshguard::retry::RetryPolicy;
use meshguard::score::{Label, Score};
use meshguard::storage::{self, Pool, StateStore};
use meshguard::target::{Target, TargetRegistry};
use tempfile::TempDir;
use tokio::sync::Notify;

/// One call received by [`FakeCluster`].
#[derive(Debug, Clone)]
pub struct Call {
    pub key: String,
    pub already_applied: bool,
}

/// In-process cluster: remembers route weights and replica counts, honours
/// idempotency keys, and can be told to fail or stall calls whose key
/// contains a given fragment.
#[derive(Default)]
pub struct FakeCluster {
    applied: Mutex<HashSet<IdempotencyKey>>,
    calls: Mutex<Vec<Call>>,
    routes: Mutex<HashMap<String, Vec<SubsetWeight>>>,
    replicas: Mutex<HashMap<String, u32>>,
    failing: Mutex<Vec<(String, ApplyError)>>,
    stalled: Mutex<Vec<String>>,
    release: Notify,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call whose key contains `fragment` fails with `error`.
    pub fn fail_matching(&self, fragment: &str, error: ApplyError) {
        self.failing.lock().unwrap().push((fragment.to_string(), error));
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Calls whose key contains `fragment` block until [`FakeCluster::release`].
    pub fn stall_matching(&self, fragment: &str) {
        self.stalled.lock().unwrap().push(fragment.to_string());
    }

    pub fn release(&self) {
        self.stalled.lock().unwrap().clear();
        self.release.notify_waiters();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, fragment: &str) -> usize {
        self.calls().iter().filter(|c| c.key.contains(fragment)).count()
    }

    pub fn route(&self, route: &str) -> Vec<(String, u32)> {
        self.routes
            .lock()
            .unwrap()
            .get(route)
            .map(|ws| ws.iter().map(|w| (w.subset.clone(), w.weight)).collect())
            .unwrap_or_default()
    }

    pub fn replicas(&self, deployment: &str) -> Option<u32> {
        self.replicas.lock().unwrap().get(deployment).copied()
    }

    async fn gate(&self, key: &IdempotencyKey) -> Result<bool, ApplyError> {
        loop {
            let released = self.release.notified();
            let stalled = self
                .stalled
                .lock()
                .unwrap()
                .iter()
                .any(|f| key.as_str().contains(f.as_str()));
            if !stalled {
                break;
            }
            released.await;
        }

        let failure = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .find(|(f, _)| key.as_str().contains(f.as_str()))
            .map(|(_, e)| e.clone());
        if let Some(error) = failure {
            self.calls.lock().unwrap().push(Call {
                key: key.to_string(),
                already_applied: false,
            });
            return Err(error);
        }

        let already_applied = !self.applied.lock().unwrap().insert(key.clone());
        self.calls.lock().unwrap().push(Call {
            key: key.to_string(),
            already_applied,
        });
        Ok(already_applied)
    }
}

#[async_trait::async_trait]
impl ClusterAdapter for FakeCluster {
    async fn reweight_route(
        &self,
        _target: &str,
        route: &str,
        _host: &str,
        weights: &[SubsetWeight],
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        let already_applied = self.gate(key).await?;
        if !already_applied {
            self.routes
                .lock()
                .unwrap()
                .insert(route.to_string(), weights.to_vec());
        }
        Ok(Ack {
            key: key.clone(),
            already_applied,
        })
    }

    async fn scale_deployment(
        &self,
        _target: &str,
        deployment: &str,
        replicas: u32,
        key: &IdempotencyKey,
    ) -> Result<Ack, ApplyError> {
        let already_applied = self.gate(key).await?;
        if !already_applied {
            self.replicas
                .lock()
                .unwrap()
                .insert(deployment.to_string(), replicas);
        }
        Ok(Ack {
            key: key.clone(),
            already_applied,
        })
    }
}

pub fn open_db() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = storage::open_pool(dir.path().join("meshguard.db")).unwrap();
    (dir, pool)
}

pub fn registry(names: &[&str]) -> Arc<TargetRegistry> {
    Arc::new(TargetRegistry::new(names.iter().map(|n| Target::new(n))))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(5), Duration::from_millis(20))
}

pub fn orchestrator(pool: &Pool, registry: Arc<TargetRegistry>, cluster: Arc<FakeCluster>) -> Orchestrator {
    Orchestrator::new(
        registry,
        cluster,
        StateStore::new(pool.clone()),
        AlertManager::new(pool.clone()),
        fast_retry(),
    )
    .unwrap()
}

/// 2025-05-01 at the given time of day.
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, h, m, s).unwrap()
}

pub fn window(target: &str, start: DateTime<Utc>, requests: u64) -> Window {
    Window {
        target: target.to_string(),
        start,
        end: start + chrono::Duration::seconds(20),
        features: WindowFeatures {
            request_count: requests,
            distinct_sources: 1,
            max_requests_per_source: requests,
            mean_requests_per_source: requests as f64,
            ..Default::default()
        },
    }
}

pub fn report(target: &str, start: DateTime<Utc>) -> AnomalyReport {
    let score = Score {
        label: Label::Anomalous,
        confidence: 0.97,
        explanation: vec![],
    };
    AnomalyReport::new(window(target, start, 500), score, start + chrono::Duration::seconds(21))
}
