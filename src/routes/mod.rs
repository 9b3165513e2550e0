//! HTTP surface

pub mod events;
pub mod health;
pub mod jobs;
pub mod metrics;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Header carrying the acting user's id
pub const USER_HEADER: &str = "x-user-id";

/// Acting user of a request
pub(crate) fn acting_user(headers: &HeaderMap) -> Result<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".into()))
}

async fn count_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.metrics.inc_requests();
    next.run(request).await
}

/// Full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Jobs
        .route("/api/v1/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/api/v1/jobs/stats", get(jobs::job_stats))
        .route("/api/v1/jobs/:id", get(jobs::get_job))
        .route("/api/v1/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/api/v1/jobs/:id/retry", post(jobs::retry_job))
        .route("/api/v1/jobs/:id/events", get(events::job_events))
        // Training
        .route("/api/v1/connections/:id/train", post(jobs::train_connection))
        .route("/api/v1/scheduler/run", post(jobs::run_scheduler))
        // Live notifications
        .route("/api/v1/notifications/stream", get(events::notification_stream))
        // State and middleware
        .layer(middleware::from_fn_with_state(state.clone(), count_requests))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
