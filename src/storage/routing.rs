//! Persistence of per-target routing state.

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::orchestrator::{Phase, RoutingState};
use crate::report::ReportId;
use crate::storage::{parse_ts, Pool};
use crate::target::{RouteConfig, RouteWeights};

const COLUMNS: &str = "target, phase, last_report_id, last_report_start, incident_active_at,
     primary_weight, standby_weight, replicas, updated_at";

/// Reads and writes the `routing_state` table, one row per target.
#[derive(Clone)]
pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn load(&self, target: &str) -> Result<Option<RoutingState>> {
        let conn = self.pool.get()?;
        let state = conn
            .query_row(
                &format!("SELECT {} FROM routing_state WHERE target = ?1", COLUMNS),
                [target],
                from_row,
            )
            .optional()?;
        Ok(state)
    }

    pub fn load_all(&self) -> Result<Vec<RoutingState>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routing_state ORDER BY target",
            COLUMNS
        ))?;
        let states = stmt
            .query_map([], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Insert or replace the row for `state.target`.
    pub fn save(&self, state: &RoutingState) -> Result<()> {
        let conn = self.pool.get()?;
        let ts = |t: Option<chrono::DateTime<Utc>>| {
            t.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        };
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO routing_state ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                COLUMNS
            ),
            params![
                state.target,
                state.phase.as_str(),
                state.last_report.as_ref().map(|r| r.as_str().to_string()),
                ts(state.last_report_start),
                ts(state.incident_active_at),
                state.applied.weights.primary,
                state.applied.weights.standby,
                state.applied.replicas,
                state.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(())
    }
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RoutingState> {
    let phase: String = row.get(1)?;
    let phase = Phase::parse(&phase).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown phase {:?}", phase).into(),
        )
    })?;
    let last_report: Option<String> = row.get(2)?;
    let last_report_start: Option<String> = row.get(3)?;
    let incident_active_at: Option<String> = row.get(4)?;
    let updated_at: String = row.get(8)?;

    Ok(RoutingState {
        target: row.get(0)?,
        phase,
        last_report: last_report.map(ReportId::from),
        last_report_start: last_report_start.as_deref().and_then(parse_ts),
        incident_active_at: incident_active_at.as_deref().and_then(parse_ts),
        applied: RouteConfig {
            weights: RouteWeights {
                primary: row.get(5)?,
                standby: row.get(6)?,
            },
            replicas: row.get(7)?,
        },
        updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
    })
}
