//! Traffic analysis -- request events, fixed-width windows and their features.

pub mod aggregator;
pub mod stats;

pub use aggregator::{AggregatorStats, FeatureAggregator, Ingest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed request against a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Request id when the proxy logs one; used to drop duplicate deliveries.
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Logical target name.
    pub target: String,
    /// Client address without port.
    pub source: String,
    pub latency_ms: f64,
    pub status: u16,
}

impl Event {
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// Statistical summary of one window. All-zero for an idle window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowFeatures {
    pub request_count: u64,
    pub distinct_sources: u64,
    pub max_requests_per_source: u64,
    pub mean_requests_per_source: f64,
    /// Fraction of responses with status >= 400.
    pub error_ratio: f64,
    pub latency_mean_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
}

impl WindowFeatures {
    /// Feature names in [`WindowFeatures::to_vector`] order.
    pub const NAMES: [&'static str; 8] = [
        "request_count",
        "distinct_sources",
        "max_requests_per_source",
        "mean_requests_per_source",
        "error_ratio",
        "latency_mean_ms",
        "latency_p50_ms",
        "latency_p95_ms",
    ];

    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.request_count as f64,
            self.distinct_sources as f64,
            self.max_requests_per_source as f64,
            self.mean_requests_per_source,
            self.error_ratio,
            self.latency_mean_ms,
            self.latency_p50_ms,
            self.latency_p95_ms,
        ]
    }
}

/// Aggregated traffic of one target over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub target: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub features: WindowFeatures,
}
