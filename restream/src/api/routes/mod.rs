//! API route modules.

pub mod health;
pub mod hls;
pub mod stream;

use axum::Router;
use axum::routing::get;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream", get(stream::stream_get))
        .route("/hls/{id}/{file}", get(hls::hls_file_get))
        .route("/api/health", get(health::health_check))
        .route("/api/sessions", get(health::list_sessions))
        .fallback(|| async { ApiError::not_found("Not found") })
        .with_state(state)
}
