//! Per-target routing state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::ReportId;
use crate::target::{RouteConfig, Target};

/// Failover lifecycle of a target. Cyclic; there is no terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Stable,
    FailingOver,
    FailedOver,
    Restoring,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stable => "STABLE",
            Phase::FailingOver => "FAILING_OVER",
            Phase::FailedOver => "FAILED_OVER",
            Phase::Restoring => "RESTORING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STABLE" => Some(Phase::Stable),
            "FAILING_OVER" => Some(Phase::FailingOver),
            "FAILED_OVER" => Some(Phase::FailedOver),
            "RESTORING" => Some(Phase::Restoring),
            _ => None,
        }
    }

    /// Phases with a mutation sequence in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Phase::FailingOver | Phase::Restoring)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator must remember about a target across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingState {
    pub target: String,
    pub phase: Phase,
    /// Last report that produced intents.
    pub last_report: Option<ReportId>,
    /// Window start of `last_report`; later reports must start after it.
    pub last_report_start: Option<DateTime<Utc>>,
    /// Most recent evidence that the incident is still going on.
    pub incident_active_at: Option<DateTime<Utc>>,
    /// Route weights and replicas as last acknowledged by the cluster.
    pub applied: RouteConfig,
    pub updated_at: DateTime<Utc>,
}

impl RoutingState {
    pub fn initial(target: &Target) -> Self {
        Self {
            target: target.name.clone(),
            phase: Phase::Stable,
            last_report: None,
            last_report_start: None,
            incident_active_at: None,
            applied: target.baseline(),
            updated_at: Utc::now(),
        }
    }

    /// Whether a report for a window starting at `start` was already acted
    /// upon (or superseded by a newer one).
    pub fn is_duplicate(&self, start: DateTime<Utc>) -> bool {
        self.last_report_start.is_some_and(|last| start <= last)
    }

    /// Push the incident activity mark forward, never backward.
    pub fn touch_incident(&mut self, at: DateTime<Utc>) {
        self.incident_active_at = Some(match self.incident_active_at {
            Some(prev) if prev > at => prev,
            _ => at,
        });
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_phase_names_round_trip() {
        for p in [Phase::Stable, Phase::FailingOver, Phase::FailedOver, Phase::Restoring] {
            assert_eq!(Phase::parse(p.as_str()), Some(p));
            assert_eq!(serde_json::to_value(p).unwrap(), p.as_str());
        }
        assert_eq!(Phase::parse("bogus"), None);
    }

    #[test]
    fn test_duplicate_and_incident_marks() {
        let mut state = RoutingState::initial(&Target::new("ratings"));
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap();
        assert!(!state.is_duplicate(t0));

        state.last_report_start = Some(t0);
        assert!(state.is_duplicate(t0));
        assert!(state.is_duplicate(t0 - chrono::Duration::seconds(20)));
        assert!(!state.is_duplicate(t0 + chrono::Duration::seconds(20)));

        state.touch_incident(t0);
        state.touch_incident(t0 - chrono::Duration::seconds(60));
        assert_eq!(state.incident_active_at, Some(t0));
    }
}
