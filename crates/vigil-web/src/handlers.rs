//! Request handlers for the four operational endpoints.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use vigil_core::api::MemoryView;

use crate::state::ApiState;

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<ApiState>) -> Response {
    let body = state.registry.render_text();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// `GET /api/v1/metrics/performance` — JSON snapshot of the registry
/// plus memory-manager statistics.
pub async fn performance(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let memory = state.memory.stats();
    Json(json!({
        "metrics": state.registry.snapshot_json(),
        "memory": MemoryView::from(&memory),
    }))
}

/// `GET /api/v1/operations/alerts` — recent alerts, newest first.
pub async fn alerts(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let alerts = (state.recent_alerts)(50);
    Json(json!(alerts))
}

/// `GET /api/v1/operations/state` — engine top-N snapshot.
pub async fn engine_state(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!((state.engine_state)()))
}
