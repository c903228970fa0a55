use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::analysis::stats::{mean, percentile, sorted_samples};
use crate::analysis::{Event, Window, WindowFeatures};

/// Outcome of ingesting one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    /// The event's window was already emitted.
    Late,
    /// Same request id already counted in its window.
    Duplicate,
    UnknownTarget,
}

/// Counters for events that did not make it into a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub late_dropped: u64,
    pub duplicates: u64,
    pub unknown_target: u64,
    pub windows_emitted: u64,
}

/// Running sums for one open window.
#[derive(Debug, Default)]
struct WindowAcc {
    latencies: Vec<f64>,
    per_source: HashMap<String, u64>,
    errors: u64,
    seen_ids: HashSet<String>,
}

impl WindowAcc {
    fn count(&self) -> u64 {
        self.latencies.len() as u64
    }

    fn add(&mut self, event: Event) -> bool {
        if let Some(id) = &event.id {
            if !self.seen_ids.insert(id.clone()) {
                return false;
            }
        }
        if event.is_error() {
            self.errors += 1;
        }
        *self.per_source.entry(event.source).or_default() += 1;
        self.latencies.push(event.latency_ms);
        true
    }

    fn into_features(self) -> WindowFeatures {
        let count = self.count();
        if count == 0 {
            return WindowFeatures::default();
        }

        let distinct = self.per_source.len() as u64;
        let max_per_source = self.per_source.values().copied().max().unwrap_or(0);
        let latency_mean = mean(&self.latencies);
        let sorted = sorted_samples(self.latencies);

        WindowFeatures {
            request_count: count,
            distinct_sources: distinct,
            max_requests_per_source: max_per_source,
            mean_requests_per_source: count as f64 / distinct.max(1) as f64,
            error_ratio: self.errors as f64 / count as f64,
            latency_mean_ms: latency_mean,
            latency_p50_ms: percentile(&sorted, 0.50),
            latency_p95_ms: percentile(&sorted, 0.95),
        }
    }
}

/// Per-target window buffer. `watermark` is the start of the oldest window
/// not yet emitted; everything before it is closed for good.
#[derive(Debug)]
struct TargetBuffer {
    watermark: i64,
    open: BTreeMap<i64, WindowAcc>,
}

/// Turns raw request events into fixed-width, non-overlapping windows per
/// target.
///
/// Windows are aligned to multiples of the width since the Unix epoch. Each
/// target owns its buffer exclusively, so aggregation needs no cross-target
/// coordination. Emission is monotonic: once a window is flushed, late events
/// for it are dropped and counted.
#[derive(Debug)]
pub struct FeatureAggregator {
    width_ms: i64,
    buffers: BTreeMap<String, TargetBuffer>,
    stats: AggregatorStats,
}

impl FeatureAggregator {
    /// Create an aggregator for `targets`; the first window of every target
    /// starts at `origin` aligned down to the window width.
    pub fn new(width: Duration, targets: impl IntoIterator<Item = String>, origin: DateTime<Utc>) -> Self {
        let width_ms = (width.as_millis() as i64).max(1);
        let watermark = align(origin.timestamp_millis(), width_ms);
        let buffers = targets
            .into_iter()
            .map(|t| {
                (
                    t,
                    TargetBuffer {
                        watermark,
                        open: BTreeMap::new(),
                    },
                )
            })
            .collect();

        Self {
            width_ms,
            buffers,
            stats: AggregatorStats::default(),
        }
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Start of the oldest window of `target` that is still open. Events
    /// before it can only be dropped as late.
    pub fn open_since(&self, target: &str) -> Option<DateTime<Utc>> {
        self.buffers.get(target).map(|b| from_millis(b.watermark))
    }

    /// Start of the window containing `ts`.
    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(align(ts.timestamp_millis(), self.width_ms))
    }

    /// Add one event to its target's open window.
    pub fn ingest(&mut self, event: Event) -> Ingest {
        let width_ms = self.width_ms;
        let Some(buffer) = self.buffers.get_mut(&event.target) else {
            self.stats.unknown_target += 1;
            debug!(service = %event.target, "Dropping event for unregistered target");
            return Ingest::UnknownTarget;
        };

        let start = align(event.timestamp.timestamp_millis(), width_ms);
        if start < buffer.watermark {
            self.stats.late_dropped += 1;
            debug!(
                service = %event.target,
                ts = %event.timestamp,
                "Dropping late event for closed window"
            );
            return Ingest::Late;
        }

        if buffer.open.entry(start).or_default().add(event) {
            self.stats.accepted += 1;
            Ingest::Accepted
        } else {
            self.stats.duplicates += 1;
            Ingest::Duplicate
        }
    }

    /// Close and return every window whose end is `<= now`, oldest first per
    /// target. Targets without traffic still produce one all-zero window per
    /// interval.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<Window> {
        let now_ms = now.timestamp_millis();
        let mut closed = Vec::new();

        for (target, buffer) in self.buffers.iter_mut() {
            while buffer.watermark + self.width_ms <= now_ms {
                let start = buffer.watermark;
                let acc = buffer.open.remove(&start).unwrap_or_default();
                closed.push(Window {
                    target: target.clone(),
                    start: from_millis(start),
                    end: from_millis(start + self.width_ms),
                    features: acc.into_features(),
                });
                buffer.watermark += self.width_ms;
            }
        }

        self.stats.windows_emitted += closed.len() as u64;
        closed
    }
}

fn align(ms: i64, width_ms: i64) -> i64 {
    ms - ms.rem_euclid(width_ms)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
