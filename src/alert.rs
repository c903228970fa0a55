//! Operator-visible alerts.
//!
//! Every failure a component cannot resolve on its own ends up here with the
//! target, incident id and component name, both in the log and in the
//! `alerts` table.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::storage::Pool;

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// The component raising an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Collector,
    Scorer,
    ReportTransport,
    Orchestrator,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Collector => write!(f, "collector"),
            Component::Scorer => write!(f, "scorer"),
            Component::ReportTransport => write!(f, "report-transport"),
            Component::Orchestrator => write!(f, "orchestrator"),
        }
    }
}

/// A single alert as raised by a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub component: Component,
    pub target: Option<String>,
    /// Report id of the incident the alert belongs to.
    pub incident: Option<String>,
    pub message: String,
}

impl Alert {
    pub fn new(severity: Severity, component: Component, message: impl Into<String>) -> Self {
        Self {
            severity,
            component,
            target: None,
            incident: None,
            message: message.into(),
        }
    }

    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn incident(mut self, incident: &str) -> Self {
        self.incident = Some(incident.to_string());
        self
    }
}

/// A persisted alert.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub alert: Alert,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AlertManager {
    pool: Pool,
}

impl AlertManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Log and persist an alert.
    pub fn raise(&self, alert: Alert) -> Result<Uuid> {
        match alert.severity {
            Severity::Critical => error!(
                component = %alert.component,
                service = alert.target.as_deref().unwrap_or("-"),
                incident = alert.incident.as_deref().unwrap_or("-"),
                "ALERT: {}", alert.message
            ),
            _ => warn!(
                component = %alert.component,
                service = alert.target.as_deref().unwrap_or("-"),
                incident = alert.incident.as_deref().unwrap_or("-"),
                "ALERT: {}", alert.message
            ),
        }

        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO alerts (id, severity, component, target, incident, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                format!("{:?}", alert.severity),
                alert.component.to_string(),
                alert.target,
                alert.incident,
                alert.message,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(id)
    }

    /// Raise from a background task where there is nobody to return the
    /// error to; persistence failures are logged.
    pub fn raise_logged(&self, alert: Alert) {
        if let Err(e) = self.raise(alert) {
            error!(error = %e, "Failed to persist alert");
        }
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, severity, component, target, incident, message, created_at
             FROM alerts ORDER BY created_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut alerts = Vec::new();
        for r in rows {
            let (id, sev, comp, target, incident, message, created) = r?;
            let severity = match sev.as_str() {
                "Critical" => Severity::Critical,
                "Warning" => Severity::Warning,
                _ => Severity::Info,
            };
            let component = match comp.as_str() {
                "collector" => Component::Collector,
                "scorer" => Component::Scorer,
                "report-transport" => Component::ReportTransport,
                _ => Component::Orchestrator,
            };
            alerts.push(AlertRecord {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                alert: Alert {
                    severity,
                    component,
                    target,
                    incident,
                    message,
                },
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_default(),
            });
        }
        Ok(alerts)
    }
}
