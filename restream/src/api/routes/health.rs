//! Health and session listing routes.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::server::AppState;
use crate::session::SessionInfo;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub live_sessions: usize,
    pub pending_sessions: usize,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        live_sessions: state.registry.live_count(),
        pending_sessions: state.registry.reserved_count(),
    })
}

/// Snapshot of registered sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.snapshot())
}
