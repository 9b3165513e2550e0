//! Maintenance task - expires unclaimed jobs and recovers abandoned ones

use crate::services::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Background task that periodically moves overdue `created`/`retry` jobs to
/// `expired` and hands active attempts that outlived their window back to the
/// retry policy.
///
/// Runs every `period` (60 seconds in production).
pub async fn maintenance_task(queue: Arc<JobQueue>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    info!(period_secs = period.as_secs(), "Maintenance task started");

    loop {
        interval.tick().await;

        match queue.expire().await {
            Ok(0) => debug!("No overdue jobs"),
            Ok(expired) => info!(expired = expired, "Expired overdue jobs"),
            Err(e) => error!(error = %e, "Failed to expire overdue jobs"),
        }
    }
}
