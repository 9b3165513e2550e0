//! Health and readiness endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: CheckStatus,
    pub scheduler: CheckStatus,
    pub notifications: CheckStatus,
}

#[derive(Debug, Serialize)]
pub struct CheckStatus {
    pub healthy: bool,
    pub message: String,
}

/// GET /health
///
/// Basic health check - returns 200 if the server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /ready
///
/// Readiness check - the job store must answer; the rest is informational
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let store_check = match state.stores.jobs.health_check().await {
        Ok(()) => CheckStatus {
            healthy: true,
            message: "Connected".to_string(),
        },
        Err(e) => CheckStatus {
            healthy: false,
            message: format!("Store unavailable: {}", e),
        },
    };

    let scheduler_check = CheckStatus {
        healthy: true,
        message: if state.scheduler.is_running() {
            "Running".to_string()
        } else {
            "Stopped".to_string()
        },
    };

    let notifications_check = CheckStatus {
        healthy: true,
        message: format!("Open channels: {}", state.hub.channel_count()),
    };

    let status_code = if store_check.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if store_check.healthy { "ready" } else { "not_ready" },
            checks: ReadinessChecks {
                store: store_check,
                scheduler: scheduler_check,
                notifications: notifications_check,
            },
        }),
    )
}
