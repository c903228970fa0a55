//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::state::AppState;
use crate::orchestrator::{OrchestratorError, RecoveryTrigger};
use crate::report::{AnomalyReport, DeliveryStatus, ReportAck};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/targets/{name}", get(get_target))
        .route("/targets/{name}/restore", post(restore_target))
        .route("/reports", post(receive_report).get(list_reports))
        .route("/alerts", get(list_alerts))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = match e {
        OrchestratorError::UnknownTarget(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
        OrchestratorError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, &e.to_string())
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let scorer = state.detector.as_ref().map(|d| d.health());
    let aggregator = state.detector.as_ref().map(|d| d.aggregator_stats());
    let collector = state.detector.as_ref().map(|d| d.collector_health());
    let degraded = scorer.as_ref().is_some_and(|s| s.degraded)
        || collector.as_ref().is_some_and(|c| c.degraded);

    Json(json!({
        "data": {
            "status": if degraded { "degraded" } else { "ok" },
            "version": env!("CARGO_PKG_VERSION"),
            "scorer": scorer,
            "collector": collector,
            "aggregator": aggregator,
        },
        "meta": meta()
    }))
}

async fn target_view(state: &AppState, name: &str) -> Result<Value, OrchestratorError> {
    let routing = state.orchestrator.state(name).await?;
    let registry = state.orchestrator.registry();
    let target = registry
        .get(name)
        .ok_or_else(|| OrchestratorError::UnknownTarget(name.to_string()))?;
    Ok(json!({
        "name": target.name,
        "route": target.route,
        "host": target.host,
        "primary_subset": target.primary_subset,
        "standby_subset": target.standby_subset,
        "deployment": target.deployment,
        "physical_id": registry.physical_id(name),
        "state": routing,
    }))
}

async fn list_targets(State(state): State<AppState>) -> Response {
    let mut targets = Vec::new();
    for name in state.orchestrator.registry().names() {
        match target_view(&state, &name).await {
            Ok(view) => targets.push(view),
            Err(e) => return orchestrator_error(e),
        }
    }
    let total = targets.len();
    Json(json!({ "data": targets, "meta": { "total": total } })).into_response()
}

async fn get_target(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match target_view(&state, &name).await {
        Ok(view) => Json(json!({ "data": view, "meta": meta() })).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

async fn restore_target(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.recover(&name, RecoveryTrigger::Manual).await {
        Ok(intents) => {
            info!(service = %name, "Manual restore requested");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "data": { "target": name, "intents": intents }, "meta": meta() })),
            )
                .into_response()
        }
        Err(e) => orchestrator_error(e),
    }
}

/// Receiver endpoint. Always answers with an ack keyed by report id once the
/// orchestrator has seen the report, duplicates included.
async fn receive_report(State(state): State<AppState>, Json(report): Json<AnomalyReport>) -> Response {
    // Nothing is stored for a target this receiver does not manage.
    if state.orchestrator.registry().get(&report.target).is_none() {
        return orchestrator_error(OrchestratorError::UnknownTarget(report.target));
    }

    if let Err(e) = state.reports.insert(&report) {
        warn!(report = %report.id, "Failed to store received report: {:#}", e);
    }

    match state.orchestrator.submit(&report).await {
        Ok(decision) => {
            if let Err(e) = state.reports.mark(&report.id, DeliveryStatus::Delivered, report.attempts.max(1)) {
                warn!(report = %report.id, "Failed to mark report delivered: {:#}", e);
            }
            Json(ReportAck {
                report_id: report.id,
                decision: decision.as_str().to_string(),
            })
            .into_response()
        }
        Err(e) => orchestrator_error(e),
    }
}

async fn list_reports(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    match state.reports.list_recent(params.limit()) {
        Ok(reports) => {
            let total = reports.len();
            Json(json!({ "data": reports, "meta": { "total": total } })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn list_alerts(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    match state.alerts.list_recent(params.limit()) {
        Ok(alerts) => {
            let total = alerts.len();
            Json(json!({ "data": alerts, "meta": { "total": total } })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}
