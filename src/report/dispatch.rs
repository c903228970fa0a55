//! At-least-once report delivery.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertManager, Component, Severity};
use crate::report::{AnomalyReport, DeliveryStatus, ReportSink};
use crate::retry::RetryPolicy;
use crate::storage::ReportStore;

/// Persists each report before delivery and keeps retrying until the sink
/// acknowledges it or the retry policy is exhausted. The receiver
/// deduplicates by report id, so redelivery after a crash is safe.
#[derive(Clone)]
pub struct ReportDispatcher {
    sink: Arc<dyn ReportSink>,
    store: ReportStore,
    alerts: AlertManager,
    policy: RetryPolicy,
}

impl ReportDispatcher {
    pub fn new(
        sink: Arc<dyn ReportSink>,
        store: ReportStore,
        alerts: AlertManager,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            sink,
            store,
            alerts,
            policy,
        }
    }

    /// Store a new report as pending and deliver it.
    pub async fn dispatch(&self, report: AnomalyReport) -> Result<DeliveryStatus> {
        if !self.store.insert(&report)? {
            warn!(report = %report.id, "Report already stored; delivering again");
        }
        Ok(self.deliver(report).await)
    }

    /// Dispatch on a background task.
    pub fn spawn(&self, report: AnomalyReport) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let id = report.id.clone();
            if let Err(e) = this.dispatch(report).await {
                error!(report = %id, "Report dispatch failed: {:#}", e);
            }
        })
    }

    /// Deliver every report left pending by a previous run.
    pub async fn redeliver_pending(&self) -> Result<usize> {
        let pending = self.store.pending(1000)?;
        let count = pending.len();
        if count > 0 {
            info!(count, "Redelivering pending reports");
        }
        for report in pending {
            self.deliver(report).await;
        }
        Ok(count)
    }

    async fn deliver(&self, mut report: AnomalyReport) -> DeliveryStatus {
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            report.attempts += 1;
            match self.sink.deliver(&report).await {
                Ok(ack) => {
                    info!(
                        report = %report.id,
                        service = %report.target,
                        decision = %ack.decision,
                        attempts = report.attempts,
                        "Report delivered"
                    );
                    self.mark(&report, DeliveryStatus::Delivered);
                    return DeliveryStatus::Delivered;
                }
                Err(e) if e.retryable && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        report = %report.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "{}", e
                    );
                    self.mark(&report, DeliveryStatus::Pending);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break e,
            }
        };

        self.mark(&report, DeliveryStatus::Failed);
        self.alerts.raise_logged(
            Alert::new(
                Severity::Critical,
                Component::ReportTransport,
                format!("{} after {} attempt(s)", failure, report.attempts),
            )
            .target(&report.target)
            .incident(report.id.as_str()),
        );
        DeliveryStatus::Failed
    }

    fn mark(&self, report: &AnomalyReport, status: DeliveryStatus) {
        if let Err(e) = self.store.mark(&report.id, status, report.attempts) {
            error!(report = %report.id, "Failed to record delivery status: {:#}", e);
        }
    }
}
