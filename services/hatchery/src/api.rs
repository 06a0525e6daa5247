//! Health and status endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::hatchery::Hatchery;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub hatchery: String,
    pub version: String,
    /// Current timestamp (RFC 3339).
    pub timestamp: String,
}

/// Build the operator router.
pub fn create_router(hatchery: Arc<Hatchery>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(hatchery)
}

async fn healthz(State(hatchery): State<Arc<Hatchery>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "hatchery".to_string(),
        hatchery: hatchery.name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Minimal liveness probe.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

/// Status report; 503 when the provider inventory cannot be listed.
async fn status(State(hatchery): State<Arc<Hatchery>>) -> impl IntoResponse {
    let report = hatchery.status().await;
    let code = if report.inventory_error.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}
