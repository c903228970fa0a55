//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Version written by [`migrate`]; bump with every schema change.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS routing_state (
            target TEXT PRIMARY KEY,
            phase TEXT NOT NULL,
            last_report_id TEXT,
            last_report_start TEXT,
            incident_active_at TEXT,
            primary_weight INTEGER NOT NULL,
            standby_weight INTEGER NOT NULL,
            replicas INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS anomaly_reports (
            id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_json TEXT NOT NULL,
            score_json TEXT NOT NULL,
            delivery TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            severity TEXT NOT NULL,
            component TEXT NOT NULL,
            target TEXT,
            incident TEXT,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reports_created ON anomaly_reports(created_at);
        CREATE INDEX IF NOT EXISTS idx_reports_delivery ON anomaly_reports(delivery);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["routing_state", "anomaly_reports", "alerts"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{} should start empty", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![SCHEMA_VERSION]);
    }
}
