//! Persistence of anomaly reports and their delivery status.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Row};

use crate::report::{AnomalyReport, DeliveryStatus, ReportId};
use crate::storage::{parse_ts, Pool};

#[derive(Clone)]
pub struct ReportStore {
    pool: Pool,
}

impl ReportStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Store a new report. Returns `false` if a report with the same id
    /// already exists; the stored row is left untouched.
    pub fn insert(&self, report: &AnomalyReport) -> Result<bool> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO anomaly_reports
                (id, target, window_start, window_json, score_json, delivery, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.id.as_str(),
                report.target,
                report.window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
                serde_json::to_string(&report.window)?,
                serde_json::to_string(&report.score)?,
                report.delivery.as_str(),
                report.attempts,
                report.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn mark(&self, id: &ReportId, delivery: DeliveryStatus, attempts: u32) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE anomaly_reports SET delivery = ?2, attempts = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id.as_str(),
                delivery.as_str(),
                attempts,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<AnomalyReport>> {
        self.query(
            "SELECT id, target, window_json, score_json, delivery, attempts, created_at
             FROM anomaly_reports ORDER BY created_at DESC LIMIT ?1",
            limit,
        )
    }

    /// Reports whose delivery never completed, oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<AnomalyReport>> {
        self.query(
            "SELECT id, target, window_json, score_json, delivery, attempts, created_at
             FROM anomaly_reports WHERE delivery = 'pending' ORDER BY created_at ASC LIMIT ?1",
            limit,
        )
    }

    fn query(&self, sql: &str, limit: usize) -> Result<Vec<AnomalyReport>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([limit as i64], raw_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawReport::decode).collect()
    }
}

struct RawReport {
    id: String,
    target: String,
    window: String,
    score: String,
    delivery: String,
    attempts: u32,
    created_at: String,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawReport> {
    Ok(RawReport {
        id: row.get(0)?,
        target: row.get(1)?,
        window: row.get(2)?,
        score: row.get(3)?,
        delivery: row.get(4)?,
        attempts: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RawReport {
    fn decode(self) -> Result<AnomalyReport> {
        Ok(AnomalyReport {
            window: serde_json::from_str(&self.window)
                .with_context(|| format!("report {}: bad window", self.id))?,
            score: serde_json::from_str(&self.score)
                .with_context(|| format!("report {}: bad score", self.id))?,
            id: ReportId::from(self.id),
            target: self.target,
            created_at: parse_ts(&self.created_at).unwrap_or_else(Utc::now),
            delivery: DeliveryStatus::parse(&self.delivery),
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Window, WindowFeatures};
    use crate::score::{Label, Score};
    use chrono::TimeZone;

    fn report(target: &str, offset: i64) -> AnomalyReport {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset);
        let window = Window {
            target: target.to_string(),
            start,
            end: start + chrono::Duration::seconds(20),
            features: WindowFeatures {
                request_count: 500,
                distinct_sources: 2,
                ..Default::default()
            },
        };
        let score = Score {
            label: Label::Anomalous,
            confidence: 0.95,
            explanation: vec![],
        };
        AnomalyReport::new(window, score, start + chrono::Duration::seconds(21))
    }

    #[test]
    fn test_insert_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ReportStore::new(crate::storage::open_pool(dir.path().join("r.db"))?);

        let r = report("ratings", 0);
        assert!(store.insert(&r)?);
        assert!(!store.insert(&r)?);

        let listed = store.list_recent(10)?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], r);
        Ok(())
    }

    #[test]
    fn test_pending_tracks_delivery() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ReportStore::new(crate::storage::open_pool(dir.path().join("r.db"))?);

        let a = report("ratings", 0);
        let b = report("reviews", 20);
        store.insert(&a)?;
        store.insert(&b)?;
        assert_eq!(store.pending(10)?.len(), 2);

        store.mark(&a.id, DeliveryStatus::Delivered, 1)?;
        store.mark(&b.id, DeliveryStatus::Failed, 5)?;
        assert!(store.pending(10)?.is_empty());

        let failed = store
            .list_recent(10)?
            .into_iter()
            .find(|r| r.id == b.id)
            .expect("report b stored");
        assert_eq!(failed.delivery, DeliveryStatus::Failed);
        assert_eq!(failed.attempts, 5);
        Ok(())
    }
}
