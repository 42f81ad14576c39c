use crate::app::AppState;
use crate::error::EngineError;
use crate::event::CarrierEvent;
use crate::spam::{SpamReport, SpamRuleDef};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

#[cfg(test)]
mod tests;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/call/event", post(carrier_event))
        .route("/calls/{call_id}", get(get_call))
        .route("/calls/{call_id}/events", get(get_call_events))
        .route("/calls/{call_id}/resolution", post(set_resolution))
        .route("/queues/{tenant_id}/{department}", get(queue_status))
        .route("/spam/rules/{tenant_id}", get(list_rules).post(create_rule))
        .route(
            "/spam/rules/{tenant_id}/{rule_id}/deactivate",
            post(deactivate_rule),
        )
        .route("/spam/report", post(spam_report))
}

fn error_response(e: EngineError) -> Response {
    let status = match &e {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Consistency { .. } => StatusCode::CONFLICT,
        EngineError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::ExternalService(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Carrier gateway webhook: one call-lifecycle event per request.
async fn carrier_event(
    State(state): State<AppState>,
    Json(event): Json<CarrierEvent>,
) -> Response {
    match state.dispatch_carrier_event(event).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_call(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    match state.ledger.snapshot(&call_id).await {
        Some(call) => Json(call).into_response(),
        None => error_response(EngineError::NotFound(format!("call {}", call_id))),
    }
}

async fn get_call_events(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    match state.ledger.events(&call_id).await {
        Some(events) => Json(events).into_response(),
        None => error_response(EngineError::NotFound(format!("call {}", call_id))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolutionUpdate {
    resolution: Option<String>,
    satisfaction_score: Option<u8>,
}

/// Resolution notes and satisfaction may be attached even after the
/// call reached a terminal state; the status itself stays frozen.
async fn set_resolution(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Json(update): Json<ResolutionUpdate>,
) -> Response {
    let Some(entry) = state.ledger.get(&call_id).await else {
        return error_response(EngineError::NotFound(format!("call {}", call_id)));
    };
    let mut guard = entry.lock().await;
    if let Some(resolution) = update.resolution {
        guard.set_resolution(resolution);
    }
    if let Some(score) = update.satisfaction_score {
        guard.set_satisfaction(score);
    }
    guard.annotate("console", "resolution metadata updated");
    StatusCode::NO_CONTENT.into_response()
}

async fn queue_status(
    State(state): State<AppState>,
    Path((tenant_id, department)): Path<(String, String)>,
) -> Response {
    let depth = state.queue.depth(&tenant_id, &department);
    Json(json!({
        "tenantId": tenant_id,
        "department": department,
        "depth": depth,
    }))
    .into_response()
}

async fn list_rules(State(state): State<AppState>, Path(tenant_id): Path<String>) -> Response {
    Json(state.spam.rules_view(&tenant_id)).into_response()
}

async fn create_rule(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(def): Json<SpamRuleDef>,
) -> Response {
    match state.spam.add_rule(&tenant_id, def) {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn deactivate_rule(
    State(state): State<AppState>,
    Path((tenant_id, rule_id)): Path<(String, String)>,
) -> Response {
    match state.spam.deactivate_rule(&tenant_id, &rule_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn spam_report(State(state): State<AppState>, Json(report): Json<SpamReport>) -> Response {
    match state.spam.report_outcome(report) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
