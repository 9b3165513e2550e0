//! Prometheus metrics endpoint

use axum::extract::State;
use axum::response::IntoResponse;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::AppState;

/// Application metrics for Prometheus
#[derive(Default)]
pub struct Metrics {
    /// Jobs accepted by the queue (dedup hits excluded)
    pub jobs_created_total: AtomicU64,
    pub jobs_completed_total: AtomicU64,
    /// Terminal failures after retries ran out
    pub jobs_failed_total: AtomicU64,
    pub jobs_retried_total: AtomicU64,
    pub notifications_sent_total: AtomicU64,
    pub channels_pruned_total: AtomicU64,
    pub sweeps_total: AtomicU64,
    /// Total requests processed
    pub requests_total: AtomicU64,
    open_channels: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_jobs_created(&self) {
        self.jobs_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_completed(&self) {
        self.jobs_completed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_retried(&self) {
        self.jobs_retried_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications_sent(&self, count: u64) {
        self.notifications_sent_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_channels_pruned(&self) {
        self.channels_pruned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sweeps(&self) {
        self.sweeps_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_open_channels(&self, count: u64) {
        self.open_channels.store(count, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_created_total: self.jobs_created_total.load(Ordering::Relaxed),
            jobs_completed_total: self.jobs_completed_total.load(Ordering::Relaxed),
            jobs_failed_total: self.jobs_failed_total.load(Ordering::Relaxed),
            jobs_retried_total: self.jobs_retried_total.load(Ordering::Relaxed),
            notifications_sent_total: self.notifications_sent_total.load(Ordering::Relaxed),
            channels_pruned_total: self.channels_pruned_total.load(Ordering::Relaxed),
            sweeps_total: self.sweeps_total.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            open_channels: self.open_channels.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_created_total: u64,
    pub jobs_completed_total: u64,
    pub jobs_failed_total: u64,
    pub jobs_retried_total: u64,
    pub notifications_sent_total: u64,
    pub channels_pruned_total: u64,
    pub sweeps_total: u64,
    pub requests_total: u64,
    pub open_channels: u64,
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.get_metrics();
    let cached_connectors = state.registry.len();

    let output = format!(
        r#"# HELP schemakeeper_jobs_created_total Jobs accepted by the queue
# TYPE schemakeeper_jobs_created_total counter
schemakeeper_jobs_created_total {}

# HELP schemakeeper_jobs_completed_total Jobs completed successfully
# TYPE schemakeeper_jobs_completed_total counter
schemakeeper_jobs_completed_total {}

# HELP schemakeeper_jobs_failed_total Jobs that failed after exhausting retries
# TYPE schemakeeper_jobs_failed_total counter
schemakeeper_jobs_failed_total {}

# HELP schemakeeper_jobs_retried_total Failed attempts scheduled for another try
# TYPE schemakeeper_jobs_retried_total counter
schemakeeper_jobs_retried_total {}

# HELP schemakeeper_notifications_sent_total Notifications accepted by live channels
# TYPE schemakeeper_notifications_sent_total counter
schemakeeper_notifications_sent_total {}

# HELP schemakeeper_channels_pruned_total Dead notification channels removed
# TYPE schemakeeper_channels_pruned_total counter
schemakeeper_channels_pruned_total {}

# HELP schemakeeper_sweeps_total Scheduler sweeps run
# TYPE schemakeeper_sweeps_total counter
schemakeeper_sweeps_total {}

# HELP schemakeeper_requests_total Total number of HTTP requests processed
# TYPE schemakeeper_requests_total counter
schemakeeper_requests_total {}

# HELP schemakeeper_open_channels Currently open notification channels
# TYPE schemakeeper_open_channels gauge
schemakeeper_open_channels {}

# HELP schemakeeper_cached_connectors Connectors held by the registry
# TYPE schemakeeper_cached_connectors gauge
schemakeeper_cached_connectors {}

# HELP schemakeeper_info Build information
# TYPE schemakeeper_info gauge
schemakeeper_info{{version="{}"}} 1
"#,
        snapshot.jobs_created_total,
        snapshot.jobs_completed_total,
        snapshot.jobs_failed_total,
        snapshot.jobs_retried_total,
        snapshot.notifications_sent_total,
        snapshot.channels_pruned_total,
        snapshot.sweeps_total,
        snapshot.requests_total,
        snapshot.open_channels,
        cached_connectors,
        env!("CARGO_PKG_VERSION"),
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}
