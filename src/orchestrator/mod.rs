//! Failover orchestrator -- per-target state machine turning anomaly reports
//! into idempotent cluster mutations.
//!
//! ```text
//! STABLE --report--> FAILING_OVER --all acked--> FAILED_OVER
//!    ^                    |                           |
//!    |          failure: rollback            recovery signal
//!    |                    v                           v
//!    +--------------------+<------all acked------ RESTORING
//! ```
//!
//! Each target owns a slot behind its own async mutex. Slots are created once
//! at construction, so reports for different targets never contend, while
//! reports for the same target are serialized. Mutation sequences run in a
//! background task per target; at most one is live at a time. A sequence
//! only commits its result if the slot generation it was started under is
//! still current, which is how a preempted failover is discarded.

pub mod apply;
pub mod intent;
pub mod state;

pub use apply::{apply_with_retry, ApplyOutcome};
pub use intent::{
    apply_to, failover_intents, restore_intents, IdempotencyKey, IntentKind, IntentParams,
    IntentPurpose, MutationIntent, SubsetWeight,
};
pub use state::{Phase, RoutingState};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertManager, Component, Severity};
use crate::cluster::{ApplyError, ClusterAdapter};
use crate::report::{AnomalyReport, ReportId};
use crate::retry::RetryPolicy;
use crate::storage::StateStore;
use crate::target::{Target, TargetRegistry};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    #[error("target '{target}' is {phase}; cannot {action}")]
    InvalidTransition {
        target: String,
        phase: Phase,
        action: &'static str,
    },
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// What the orchestrator did with a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    /// The target was stable; failover intents were issued.
    Started { intents: Vec<MutationIntent> },
    /// A failover or restore is already under way; the report only extended
    /// the incident.
    Deferred,
    /// The report (or a newer one) was already acted upon.
    Duplicate,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Started { .. } => "started",
            Decision::Deferred => "deferred",
            Decision::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// Operator command. May preempt an in-flight failover.
    Manual,
    /// Quiet-period timer.
    Timer,
}

struct Slot {
    state: RoutingState,
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<TargetRegistry>,
    adapter: Arc<dyn ClusterAdapter>,
    store: StateStore,
    alerts: AlertManager,
    retry: RetryPolicy,
    slots: BTreeMap<String, Mutex<Slot>>,
}

enum Completion {
    Done,
    Failed {
        intent: MutationIntent,
        error: ApplyError,
        attempts: u32,
    },
    Cancelled,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build the orchestrator, restoring every target's persisted state.
    /// Call [`Orchestrator::resume`] afterwards to finish interrupted
    /// transitions.
    pub fn new(
        registry: Arc<TargetRegistry>,
        adapter: Arc<dyn ClusterAdapter>,
        store: StateStore,
        alerts: AlertManager,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let mut persisted: HashMap<String, RoutingState> = store
            .load_all()
            .context("loading routing state")?
            .into_iter()
            .map(|s| (s.target.clone(), s))
            .collect();

        let mut slots = BTreeMap::new();
        for target in registry.iter() {
            let state = match persisted.remove(&target.name) {
                Some(state) => {
                    info!(service = %target.name, phase = %state.phase, "Restored routing state");
                    state
                }
                None => RoutingState::initial(target),
            };
            slots.insert(
                target.name.clone(),
                Mutex::new(Slot {
                    state,
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
            );
        }
        for name in persisted.keys() {
            warn!(service = %name, "Ignoring persisted state for unconfigured target");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                adapter,
                store,
                alerts,
                retry,
                slots,
            }),
        })
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.inner.registry
    }

    async fn slot(&self, name: &str) -> Result<MutexGuard<'_, Slot>, OrchestratorError> {
        match self.inner.slots.get(name) {
            Some(slot) => Ok(slot.lock().await),
            None => Err(OrchestratorError::UnknownTarget(name.to_string())),
        }
    }

    fn target(&self, name: &str) -> Result<Arc<Target>, OrchestratorError> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownTarget(name.to_string()))
    }

    /// Consume one anomaly report.
    pub async fn submit(&self, report: &AnomalyReport) -> Result<Decision, OrchestratorError> {
        let target = self.target(&report.target)?;
        let mut slot = self.slot(&report.target).await?;

        if slot.state.is_duplicate(report.window.start) {
            debug!(service = %target.name, report = %report.id, "Duplicate report ignored");
            return Ok(Decision::Duplicate);
        }

        if slot.state.phase != Phase::Stable {
            let mut next = slot.state.clone();
            next.touch_incident(report.window.end);
            self.inner.store.save(&next)?;
            slot.state = next;
            info!(
                service = %target.name,
                phase = %slot.state.phase,
                report = %report.id,
                "Report deferred; incident still active"
            );
            return Ok(Decision::Deferred);
        }

        // Persist the transition before anything touches the cluster, so a
        // restart resumes it instead of forgetting it.
        let mut next = slot.state.clone();
        next.set_phase(Phase::FailingOver);
        next.last_report = Some(report.id.clone());
        next.last_report_start = Some(report.window.start);
        next.touch_incident(report.window.end);
        self.inner.store.save(&next)?;
        slot.state = next;

        let intents = failover_intents(&target, &report.id);
        info!(
            service = %target.name,
            report = %report.id,
            confidence = report.score.confidence,
            "STABLE -> FAILING_OVER"
        );
        self.launch(&mut slot, target, report.id.clone(), IntentPurpose::Failover);

        Ok(Decision::Started { intents })
    }

    /// Start restoring `name` to its baseline configuration.
    pub async fn recover(
        &self,
        name: &str,
        trigger: RecoveryTrigger,
    ) -> Result<Vec<MutationIntent>, OrchestratorError> {
        let target = self.target(name)?;
        let mut slot = self.slot(name).await?;

        match (slot.state.phase, trigger) {
            (Phase::FailedOver, _) => {}
            (Phase::FailingOver, RecoveryTrigger::Manual) => {
                if let Some(cancel) = slot.cancel.take() {
                    cancel.cancel();
                }
                info!(service = %name, "Manual restore preempts in-flight failover");
            }
            (phase, _) => {
                return Err(OrchestratorError::InvalidTransition {
                    target: name.to_string(),
                    phase,
                    action: "restore",
                })
            }
        }

        let report = slot
            .state
            .last_report
            .clone()
            .unwrap_or_else(|| ReportId::for_window(name, slot.state.updated_at));

        let mut next = slot.state.clone();
        next.set_phase(Phase::Restoring);
        self.inner.store.save(&next)?;
        let from = slot.state.phase;
        slot.state = next;

        info!(service = %name, trigger = ?trigger, "{} -> RESTORING", from);
        let intents = restore_intents(&target, &report, IntentPurpose::Restore);
        self.launch(&mut slot, target, report, IntentPurpose::Restore);
        Ok(intents)
    }

    /// Restore every failed-over target that has been quiet for `quiet`.
    /// Returns the targets a restore was started for.
    pub async fn recover_due(&self, now: DateTime<Utc>, quiet: Duration) -> Vec<String> {
        let quiet = chrono::Duration::from_std(quiet).unwrap_or(chrono::Duration::MAX);
        let mut due = Vec::new();
        for (name, slot) in &self.inner.slots {
            let slot = slot.lock().await;
            if slot.state.phase != Phase::FailedOver {
                continue;
            }
            let last_activity = match slot.state.incident_active_at {
                Some(at) => at.max(slot.state.updated_at),
                None => slot.state.updated_at,
            };
            if last_activity.checked_add_signed(quiet).is_some_and(|t| t <= now) {
                due.push(name.clone());
            }
        }

        let mut started = Vec::new();
        for name in due {
            match self.recover(&name, RecoveryTrigger::Timer).await {
                Ok(_) => started.push(name),
                // Raced with another transition; the next check re-evaluates.
                Err(OrchestratorError::InvalidTransition { .. }) => {}
                Err(e) => error!(service = %name, "Automatic restore failed to start: {}", e),
            }
        }
        started
    }

    /// Re-drive transitions interrupted by a restart. Intents carry the same
    /// idempotency keys as before, so anything already applied is a no-op.
    pub async fn resume(&self) -> usize {
        let mut resumed = 0;
        for (name, slot) in &self.inner.slots {
            let mut slot = slot.lock().await;
            if !slot.state.phase.is_transitional() {
                continue;
            }
            let purpose = match slot.state.phase {
                Phase::Restoring => IntentPurpose::Restore,
                _ => IntentPurpose::Failover,
            };
            let (Some(target), Some(report)) =
                (self.inner.registry.get(name), slot.state.last_report.clone())
            else {
                warn!(service = %name, phase = %slot.state.phase, "Cannot resume transition without a report id");
                continue;
            };
            info!(service = %name, phase = %slot.state.phase, report = %report, "Resuming interrupted transition");
            self.launch(&mut slot, target, report, purpose);
            resumed += 1;
        }
        resumed
    }

    /// Wait until no mutation sequence is running for `name`.
    pub async fn settle(&self, name: &str) {
        let Some(slot) = self.inner.slots.get(name) else {
            return;
        };
        loop {
            let handle = slot.lock().await.task.take();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    /// Wait for every target's mutation sequence to finish.
    pub async fn settle_all(&self) {
        for name in self.inner.slots.keys() {
            self.settle(name).await;
        }
    }

    pub async fn state(&self, name: &str) -> Result<RoutingState, OrchestratorError> {
        Ok(self.slot(name).await?.state.clone())
    }

    pub async fn states(&self) -> Vec<RoutingState> {
        let mut states = Vec::with_capacity(self.inner.slots.len());
        for slot in self.inner.slots.values() {
            states.push(slot.lock().await.state.clone());
        }
        states
    }

    fn launch(&self, slot: &mut Slot, target: Arc<Target>, report: ReportId, purpose: IntentPurpose) {
        slot.generation += 1;
        let cancel = CancellationToken::new();
        slot.cancel = Some(cancel.clone());

        let this = self.clone();
        let generation = slot.generation;
        // A preempted sequence is left to observe its cancellation; awaiting
        // it here would deadlock on this slot's lock.
        slot.task = Some(tokio::spawn(async move {
            match purpose {
                IntentPurpose::Failover => this.drive_failover(target, report, generation, cancel).await,
                _ => this.drive_restore(target, report, generation, cancel).await,
            }
        }));
    }

    /// Lock the slot only if `generation` still owns it.
    async fn owned(&self, name: &str, generation: u64) -> Option<MutexGuard<'_, Slot>> {
        let slot = self.inner.slots.get(name)?.lock().await;
        if slot.generation != generation {
            debug!(service = %name, generation, "Superseded mutation sequence discarded");
            return None;
        }
        Some(slot)
    }

    async fn run(&self, intents: &[MutationIntent], cancel: &CancellationToken) -> Vec<ApplyOutcome> {
        join_all(
            intents
                .iter()
                .map(|i| apply_with_retry(self.inner.adapter.as_ref(), i, &self.inner.retry, cancel)),
        )
        .await
    }

    async fn drive_failover(
        self,
        target: Arc<Target>,
        report: ReportId,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let intents = failover_intents(&target, &report);
        let outcomes = self.run(&intents, &cancel).await;

        let Some(mut slot) = self.owned(&target.name, generation).await else {
            return;
        };
        let (intent, error, attempts) =
            match absorb(&mut slot.state, &target, &intents, outcomes) {
                Completion::Cancelled => return,
                Completion::Done => {
                    slot.state.set_phase(Phase::FailedOver);
                    self.persist(&slot.state);
                    info!(service = %target.name, report = %report, "FAILING_OVER -> FAILED_OVER");
                    return;
                }
                Completion::Failed {
                    intent,
                    error,
                    attempts,
                } => (intent, error, attempts),
            };
        self.persist(&slot.state);
        drop(slot);

        self.inner.alerts.raise_logged(
            Alert::new(
                Severity::Critical,
                Component::Orchestrator,
                format!(
                    "failover {} failed after {} attempt(s): {}; rolling back",
                    intent.kind().as_str(),
                    attempts,
                    error
                ),
            )
            .target(&target.name)
            .incident(report.as_str()),
        );

        // Still FAILING_OVER while rolling back, so no second sequence can
        // start for this target in the meantime.
        let rollback = restore_intents(&target, &report, IntentPurpose::Rollback);
        let outcomes = self.run(&rollback, &cancel).await;

        let Some(mut slot) = self.owned(&target.name, generation).await else {
            return;
        };
        let completion = absorb(&mut slot.state, &target, &rollback, outcomes);
        if matches!(completion, Completion::Cancelled) {
            return;
        }
        slot.state.set_phase(Phase::Stable);
        self.persist(&slot.state);
        let applied = slot.state.applied;
        drop(slot);
        info!(service = %target.name, report = %report, "FAILING_OVER -> STABLE (rolled back)");

        if let Completion::Failed { intent, error, .. } = completion {
            self.inner.alerts.raise_logged(
                Alert::new(
                    Severity::Critical,
                    Component::Orchestrator,
                    format!(
                        "rollback {} failed: {}; cluster left at weights {}/{} replicas {}",
                        intent.kind().as_str(),
                        error,
                        applied.weights.primary,
                        applied.weights.standby,
                        applied.replicas
                    ),
                )
                .target(&target.name)
                .incident(report.as_str()),
            );
        }
    }

    async fn drive_restore(
        self,
        target: Arc<Target>,
        report: ReportId,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let intents = restore_intents(&target, &report, IntentPurpose::Restore);
        let outcomes = self.run(&intents, &cancel).await;

        let Some(mut slot) = self.owned(&target.name, generation).await else {
            return;
        };
        match absorb(&mut slot.state, &target, &intents, outcomes) {
            Completion::Cancelled => {}
            Completion::Done => {
                slot.state.set_phase(Phase::Stable);
                self.persist(&slot.state);
                info!(service = %target.name, report = %report, "RESTORING -> STABLE");
            }
            Completion::Failed {
                intent,
                error,
                attempts,
            } => {
                // Traffic stays on the standby until the next recovery signal.
                slot.state.set_phase(Phase::FailedOver);
                self.persist(&slot.state);
                drop(slot);
                self.inner.alerts.raise_logged(
                    Alert::new(
                        Severity::Critical,
                        Component::Orchestrator,
                        format!(
                            "restore {} failed after {} attempt(s): {}; target remains failed over",
                            intent.kind().as_str(),
                            attempts,
                            error
                        ),
                    )
                    .target(&target.name)
                    .incident(report.as_str()),
                );
            }
        }
    }

    fn persist(&self, state: &RoutingState) {
        if let Err(e) = self.inner.store.save(state) {
            error!(service = %state.target, phase = %state.phase, "Failed to persist routing state: {:#}", e);
        }
    }
}

/// Fold acknowledged intents into `state.applied` and report how the
/// sequence ended.
fn absorb(
    state: &mut RoutingState,
    target: &Target,
    intents: &[MutationIntent],
    outcomes: Vec<ApplyOutcome>,
) -> Completion {
    let mut completion = Completion::Done;
    for (intent, outcome) in intents.iter().zip(outcomes) {
        match outcome {
            ApplyOutcome::Applied(_) => apply_to(&mut state.applied, target, &intent.params),
            ApplyOutcome::Cancelled => completion = Completion::Cancelled,
            ApplyOutcome::Failed { error, attempts } => {
                if matches!(completion, Completion::Done) {
                    completion = Completion::Failed {
                        intent: intent.clone(),
                        error,
                        attempts,
                    };
                }
            }
        }
    }
    completion
}

/// Periodically restore targets whose incident has been quiet long enough.
pub async fn run_recovery_loop(orchestrator: Orchestrator, check_every: Duration, quiet: Duration) {
    info!(
        check_secs = check_every.as_secs(),
        quiet_secs = quiet.as_secs(),
        "Recovery timer started"
    );
    let mut interval = tokio::time::interval(check_every);
    loop {
        interval.tick().await;
        let started = orchestrator.recover_due(Utc::now(), quiet).await;
        if !started.is_empty() {
            info!(targets = ?started, "Automatic restore started");
        }
    }
}
