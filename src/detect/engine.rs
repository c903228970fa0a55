use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertManager, Component, Severity};
use crate::analysis::{AggregatorStats, FeatureAggregator, Window};
use crate::collect::health::CollectorSnapshot;
use crate::collect::{CollectorHealth, LogSource};
use crate::report::{AnomalyReport, ReportBuilder, ReportDispatcher};
use crate::score::health::{HealthChange, HealthSnapshot};
use crate::score::{ScoreError, Scorer, ScorerHealth};
use crate::target::{Target, TargetRegistry};

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub window: Duration,
    pub poll_interval: Duration,
    pub confidence_threshold: f64,
    pub cooldown: Duration,
    pub degraded_after: u32,
    /// Failed collections in a row before a target is reported unmonitored.
    pub collector_degraded_after: u32,
    /// Start of the first window; aligned down to the window width.
    pub origin: DateTime<Utc>,
}

/// Outcome of one collection cycle.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub events: usize,
    pub failed_targets: Vec<String>,
    pub windows: Vec<Window>,
    /// Windows that got no decision because the scorer was unavailable.
    pub unscored: usize,
    pub reports: Vec<AnomalyReport>,
    deliveries: Vec<JoinHandle<()>>,
}

impl CycleSummary {
    /// Wait until every report of this cycle has been delivered or given up.
    pub async fn delivered(&mut self) {
        for handle in self.deliveries.drain(..) {
            let _ = handle.await;
        }
    }
}

pub struct Detector {
    registry: Arc<TargetRegistry>,
    source: Arc<dyn LogSource>,
    scorer: Arc<dyn Scorer>,
    health: ScorerHealth,
    collection: CollectorHealth,
    builder: ReportBuilder,
    dispatcher: ReportDispatcher,
    alerts: AlertManager,
    aggregator: Mutex<FeatureAggregator>,
}

impl Detector {
    pub fn new(
        registry: Arc<TargetRegistry>,
        source: Arc<dyn LogSource>,
        scorer: Arc<dyn Scorer>,
        dispatcher: ReportDispatcher,
        alerts: AlertManager,
        settings: DetectorSettings,
    ) -> Self {
        let aggregator = FeatureAggregator::new(settings.window, registry.names(), settings.origin);
        let collection = CollectorHealth::new(settings.collector_degraded_after, registry.names());
        Self {
            registry,
            source,
            scorer,
            health: ScorerHealth::new(settings.degraded_after),
            collection,
            builder: ReportBuilder::new(settings.confidence_threshold, settings.cooldown),
            dispatcher,
            alerts,
            aggregator: Mutex::new(aggregator),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn collector_health(&self) -> CollectorSnapshot {
        self.collection.snapshot()
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    /// Run one collection cycle at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleSummary {
        let mut summary = CycleSummary::default();

        // Fan out to every target; a failing one is skipped for this cycle.
        // Sources are asked back to the oldest open window, so a request
        // logged after the previous cycle still lands in its window.
        let plan: Vec<(Arc<Target>, DateTime<Utc>)> = {
            let agg = self.aggregator.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry
                .iter()
                .map(|t| (t.clone(), agg.open_since(&t.name).unwrap_or(now)))
                .collect()
        };
        let collected = join_all(plan.iter().map(|(target, since)| async move {
            (target.name.clone(), self.source.collect(target, *since).await)
        }))
        .await;

        {
            let mut agg = self.aggregator.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, result) in collected {
                match result {
                    Ok(events) => {
                        if self.collection.record_success(&name) == HealthChange::Recovered {
                            info!(service = %name, "Log collection recovered");
                        }
                        summary.events += events.len();
                        for event in events {
                            agg.ingest(event);
                        }
                    }
                    Err(e) => {
                        warn!(service = %name, "Log collection failed: {}", e);
                        if self.collection.record_failure(&name) == HealthChange::Degraded {
                            self.alerts.raise_logged(
                                Alert::new(
                                    Severity::Warning,
                                    Component::Collector,
                                    format!(
                                        "target unmonitored: {} consecutive collection failures ({})",
                                        self.collection.failures(&name),
                                        e
                                    ),
                                )
                                .target(&name),
                            );
                        }
                        summary.failed_targets.push(name);
                    }
                }
            }
            summary.windows = agg.flush(now);
        }

        let scores = join_all(summary.windows.iter().map(|w| self.scorer.score(w))).await;

        for (window, result) in summary.windows.iter().zip(scores) {
            match result {
                Ok(score) => {
                    if self.health.record_success() == HealthChange::Recovered {
                        info!("Scorer recovered");
                    }
                    debug!(
                        service = %window.target,
                        start = %window.start,
                        requests = window.features.request_count,
                        label = ?score.label,
                        confidence = score.confidence,
                        "Window scored"
                    );
                    if let Some(report) = self.builder.build(window, &score) {
                        info!(
                            service = %report.target,
                            report = %report.id,
                            confidence = report.score.confidence,
                            top = report.score.explanation.first().map(|c| c.feature.as_str()).unwrap_or("-"),
                            "Anomaly detected"
                        );
                        summary.reports.push(report);
                    }
                }
                Err(e) => {
                    summary.unscored += 1;
                    if let ScoreError::Model(_) = e {
                        warn!(service = %window.target, "{}", e);
                    } else {
                        debug!(service = %window.target, "{}", e);
                    }
                    if self.health.record_failure() == HealthChange::Degraded {
                        let snap = self.health.snapshot();
                        self.alerts.raise_logged(
                            Alert::new(
                                Severity::Warning,
                                Component::Scorer,
                                format!(
                                    "scorer degraded: {} consecutive windows without a decision ({})",
                                    snap.consecutive_failures, e
                                ),
                            )
                            .target(&window.target),
                        );
                    }
                }
            }
        }

        for report in &summary.reports {
            summary.deliveries.push(self.dispatcher.spawn(report.clone()));
        }

        summary
    }
}

/// Main detection loop: one cycle per poll interval.
pub async fn run_detector_loop(detector: Arc<Detector>, poll_interval: Duration) {
    info!(poll_secs = poll_interval.as_secs(), "Detector started");

    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;

        let summary = detector.run_cycle(Utc::now()).await;
        info!(
            events = summary.events,
            windows = summary.windows.len(),
            unscored = summary.unscored,
            reports = summary.reports.len(),
            failed_targets = summary.failed_targets.len(),
            "Collection cycle complete"
        );
    }
}
