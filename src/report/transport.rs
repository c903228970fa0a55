//! Report transport -- how a report reaches the orchestrator.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::report::{AnomalyReport, ReportId};

#[derive(Debug, Clone, Error)]
#[error("report delivery failed: {reason}")]
pub struct DeliveryError {
    pub reason: String,
    pub retryable: bool,
}

impl DeliveryError {
    fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Receiver acknowledgment, keyed by report id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportAck {
    pub report_id: ReportId,
    /// Orchestrator decision: started, deferred or duplicate.
    pub decision: String,
}

#[async_trait::async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, report: &AnomalyReport) -> Result<ReportAck, DeliveryError>;
}

/// POSTs reports as JSON to a remote receiver.
pub struct HttpReportSink {
    client: Client,
    url: String,
}

impl HttpReportSink {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ReportSink for HttpReportSink {
    async fn deliver(&self, report: &AnomalyReport) -> Result<ReportAck, DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|e| DeliveryError::retryable(format!("POST {}: {}", self.url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let reason = format!("receiver returned {}", status);
            return Err(
                if status.is_server_error()
                    || status == StatusCode::TOO_MANY_REQUESTS
                    || status == StatusCode::REQUEST_TIMEOUT
                {
                    DeliveryError::retryable(reason)
                } else {
                    DeliveryError::permanent(reason)
                },
            );
        }

        let ack: ReportAck = resp
            .json()
            .await
            .map_err(|e| DeliveryError::retryable(format!("malformed ack: {}", e)))?;
        if ack.report_id != report.id {
            return Err(DeliveryError::retryable(format!(
                "ack for {} does not match report {}",
                ack.report_id, report.id
            )));
        }
        Ok(ack)
    }
}

/// Hands reports directly to an in-process orchestrator.
#[derive(Clone)]
pub struct LocalReportSink {
    orchestrator: Orchestrator,
}

impl LocalReportSink {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ReportSink for LocalReportSink {
    async fn deliver(&self, report: &AnomalyReport) -> Result<ReportAck, DeliveryError> {
        match self.orchestrator.submit(report).await {
            Ok(decision) => Ok(ReportAck {
                report_id: report.id.clone(),
                decision: decision.as_str().to_string(),
            }),
            Err(e @ OrchestratorError::Storage(_)) => Err(DeliveryError::retryable(e.to_string())),
            Err(e) => Err(DeliveryError::permanent(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Window, WindowFeatures};
    use crate::score::{Label, Score};
    use axum::http::StatusCode as AxumStatus;
    use axum::{routing::post, Json, Router};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn report() -> AnomalyReport {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        AnomalyReport::new(
            Window {
                target: "ratings".to_string(),
                start,
                end: start + chrono::Duration::seconds(20),
                features: WindowFeatures {
                    request_count: 500,
                    ..Default::default()
                },
            },
            Score {
                label: Label::Anomalous,
                confidence: 0.95,
                explanation: vec![],
            },
            start,
        )
    }

    async fn spawn_receiver(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/v1/reports", addr)
    }

    #[tokio::test]
    async fn test_http_delivery_acked_by_id() {
        let app = Router::new().route(
            "/api/v1/reports",
            post(|Json(report): Json<AnomalyReport>| async move {
                Json(json!({ "report_id": report.id, "decision": "started" }))
            }),
        );
        let sink = HttpReportSink::new(&spawn_receiver(app).await, Duration::from_secs(2)).unwrap();
        let ack = sink.deliver(&report()).await.unwrap();
        assert_eq!(ack.report_id, report().id);
        assert_eq!(ack.decision, "started");
    }

    #[tokio::test]
    async fn test_mismatched_ack_is_retryable() {
        let app = Router::new().route(
            "/api/v1/reports",
            post(|| async { Json(json!({ "report_id": "other@x", "decision": "started" })) }),
        );
        let sink = HttpReportSink::new(&spawn_receiver(app).await, Duration::from_secs(2)).unwrap();
        assert!(sink.deliver(&report()).await.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let app = Router::new().route(
            "/api/v1/reports",
            post(|| async { (AxumStatus::NOT_FOUND, "unknown target") }),
        );
        let sink = HttpReportSink::new(&spawn_receiver(app).await, Duration::from_secs(2)).unwrap();
        assert!(!sink.deliver(&report()).await.unwrap_err().retryable);

        let app = Router::new().route(
            "/api/v1/reports",
            post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "busy") }),
        );
        let sink = HttpReportSink::new(&spawn_receiver(app).await, Duration::from_secs(2)).unwrap();
        assert!(sink.deliver(&report()).await.unwrap_err().retryable);
    }
}
