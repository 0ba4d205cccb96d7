//! Health check routes.
//!
//! Provides health and readiness endpoints, plus the Prometheus scrape
//! target, for the OAuth core.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::config::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database_connected: bool,
}

/// GET /health — reports overall health including database connectivity.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database_connected = sqlx::query("SELECT 1").execute(state.store.pool()).await.is_ok();
    let status = if database_connected { "healthy" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database_connected,
    })
}

/// GET /ready — 200 if the service can serve traffic, 503 otherwise.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database_ok = sqlx::query("SELECT 1").execute(state.store.pool()).await.is_ok();

    if database_ok {
        (axum::http::StatusCode::OK, "ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// GET /live — plain liveness probe.
pub async fn liveness_check() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "alive")
}
