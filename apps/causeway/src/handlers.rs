use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::websocket::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_sessions: usize,
}

/// GET /health - liveness and a rough load signal for probes.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_sessions: state.registry.len(),
    })
}
