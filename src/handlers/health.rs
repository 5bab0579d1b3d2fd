//! Health and readiness endpoints.
//!
//! Both paths are in the default bypass list, so probes are never rate
//! limited or blocked.
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 while the store is unreachable

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "persistence_reachable": true,
///   "degraded_events": 0,
///   "last_degraded_at": null,
///   "tracked_addresses": 12,
///   "uptime_seconds": 3600,
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let persistence_reachable = state.persistence_healthy();

    Json(HealthResponse {
        status: if persistence_reachable {
            "healthy"
        } else {
            "degraded"
        }
        .to_string(),
        persistence_reachable,
        degraded_events: state.degraded.events(),
        last_degraded_at: state.degraded.last_at(),
        tracked_addresses: state.guard.limiter().tracked(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Reflects the last background probe rather than pinging on every call.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.persistence_healthy() {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
