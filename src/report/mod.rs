//! Anomaly reports -- the durable record of one detected incident.

pub mod builder;
pub mod dispatch;
pub mod transport;

pub use builder::ReportBuilder;
pub use dispatch::ReportDispatcher;
pub use transport::{DeliveryError, HttpReportSink, LocalReportSink, ReportAck, ReportSink};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Window;
use crate::score::Score;

/// Report identifier, derived from target and window start so the same
/// window can never produce two distinct reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    pub fn for_window(target: &str, start: DateTime<Utc>) -> Self {
        Self(format!(
            "{}@{}",
            target,
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReportId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => DeliveryStatus::Delivered,
            "failed" => DeliveryStatus::Failed,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// One detected incident: the window that triggered it and how it scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub id: ReportId,
    pub target: String,
    pub window: Window,
    pub score: Score,
    pub created_at: DateTime<Utc>,
    #[serde(default = "pending")]
    pub delivery: DeliveryStatus,
    #[serde(default)]
    pub attempts: u32,
}

fn pending() -> DeliveryStatus {
    DeliveryStatus::Pending
}

impl AnomalyReport {
    pub fn new(window: Window, score: Score, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ReportId::for_window(&window.target, window.start),
            target: window.target.clone(),
            window,
            score,
            created_at,
            delivery: DeliveryStatus::Pending,
            attempts: 0,
        }
    }
}
