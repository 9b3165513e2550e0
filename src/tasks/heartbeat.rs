//! Heartbeat task - keeps notification streams alive and prunes dead ones

use crate::services::notifications::NotificationHub;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Background task that pushes a heartbeat to every open notification channel.
///
/// Channels whose receiver went away are pruned on delivery.
pub async fn heartbeat_task(hub: Arc<NotificationHub>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    info!(period_secs = period.as_secs(), "Heartbeat task started");

    loop {
        interval.tick().await;

        let delivered = hub.heartbeat();
        debug!(delivered = delivered, channels = hub.channel_count(), "Heartbeat sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::metrics::Metrics;

    #[tokio::test]
    async fn test_heartbeat_reaches_open_channels() {
        let hub = NotificationHub::new(Arc::new(Metrics::new()));
        let mut channel = hub.register("u1");
        let dead = hub.register("u2");
        drop(dead);
        assert_eq!(channel.recv().await.unwrap().event, "connected");

        let task = tokio::spawn(heartbeat_task(hub.clone(), Duration::from_millis(10)));
        let event = channel.recv().await.unwrap();
        task.abort();

        assert_eq!(event.event, "heartbeat");
        assert_eq!(hub.channel_count(), 1);
    }
}
