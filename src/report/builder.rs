use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::analysis::Window;
use crate::report::AnomalyReport;
use crate::score::Score;

/// Turns positive classifications into reports, at most one per target per
/// cooldown period.
///
/// The cooldown is measured on window start times, so a backlog of windows
/// delivered in one collection cycle is deduplicated the same way as windows
/// arriving one by one.
#[derive(Debug)]
pub struct ReportBuilder {
    threshold: f64,
    cooldown: chrono::Duration,
    last_emitted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ReportBuilder {
    pub fn new(threshold: f64, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Build a report for `window` if the score is anomalous, confident
    /// enough, and the target is not cooling down.
    pub fn build(&self, window: &Window, score: &Score) -> Option<AnomalyReport> {
        if !score.is_anomalous() || score.confidence < self.threshold {
            return None;
        }

        let mut last = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = last.get(&window.target) {
            if window.start < prev.checked_add_signed(self.cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC) {
                debug!(
                    service = %window.target,
                    window = %window.start,
                    last_report = %prev,
                    "Report suppressed by cooldown"
                );
                return None;
            }
        }
        last.insert(window.target.clone(), window.start);

        Some(AnomalyReport::new(window.clone(), score.clone(), Utc::now()))
    }
}
