//! Live delivery of job status to connected clients
//!
//! [`NotificationHub`] keeps zero or more channels per user. Delivery is
//! best-effort: a channel whose receiver is gone is pruned on the next write
//! and no caller ever sees a delivery error. [`JobEventBus`] carries push
//! events for a single job to whoever is watching it.

use chrono::Utc;
use futures_util::stream::{self, Stream};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::NotificationEvent;
use crate::routes::metrics::Metrics;

/// Per-channel buffer; a client this far behind misses events
const CHANNEL_BUFFER: usize = 256;

/// Client reconnect delay advertised on the stream
pub const RECONNECT_RETRY_MS: u64 = 3000;

/// Envelope delivered over a live stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    pub event: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl PushEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
            retry: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }
}

impl From<&NotificationEvent> for PushEvent {
    fn from(event: &NotificationEvent) -> Self {
        let data = serde_json::to_value(event).unwrap_or(Value::Null);
        PushEvent::new("notification", data).with_id(event.job_id.to_string())
    }
}

type UserChannels = HashMap<Uuid, mpsc::Sender<PushEvent>>;

/// Per-user live delivery channels
pub struct NotificationHub {
    channels: RwLock<HashMap<String, UserChannels>>,
    metrics: Arc<Metrics>,
}

impl NotificationHub {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            metrics,
        })
    }

    /// Open a channel for a user and acknowledge it immediately
    pub fn register(self: &Arc<Self>, user_id: &str) -> NotificationChannel {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let id = Uuid::new_v4();

        let ack = PushEvent::new(
            "connected",
            json!({ "channelId": id, "userId": user_id, "timestamp": Utc::now() }),
        )
        .with_retry(RECONNECT_RETRY_MS);
        // Fresh buffer, cannot be full
        let _ = tx.try_send(ack);

        self.channels
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(id, tx);
        self.metrics.set_open_channels(self.channel_count() as u64);
        info!(user_id = %user_id, channel_id = %id, "Notification channel registered");

        NotificationChannel {
            id,
            user_id: user_id.to_string(),
            rx,
            guard: ChannelGuard {
                hub: Arc::downgrade(self),
                user_id: user_id.to_string(),
                id,
            },
        }
    }

    /// Remove one channel; empty user entries are dropped
    pub fn unregister(&self, user_id: &str, channel_id: Uuid) {
        let removed = {
            let mut channels = self.channels.write();
            let removed = channels
                .get_mut(user_id)
                .and_then(|user| user.remove(&channel_id))
                .is_some();
            if channels.get(user_id).is_some_and(|user| user.is_empty()) {
                channels.remove(user_id);
            }
            removed
        };
        if removed {
            self.metrics.set_open_channels(self.channel_count() as u64);
            debug!(user_id = %user_id, channel_id = %channel_id, "Notification channel closed");
        }
    }

    /// Deliver to every channel of one user; returns how many accepted it
    pub fn send_notification(&self, user_id: &str, event: PushEvent) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<PushEvent>)> = match self.channels.read().get(user_id) {
            Some(user) => user.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return 0,
        };
        self.deliver(user_id, targets, &event)
    }

    /// Deliver a job notification to its user
    pub fn notify(&self, event: &NotificationEvent) -> usize {
        self.send_notification(&event.user_id, PushEvent::from(event))
    }

    /// Deliver to every channel of every user
    pub fn broadcast(&self, event: PushEvent) -> usize {
        let users: Vec<String> = self.channels.read().keys().cloned().collect();
        users
            .iter()
            .map(|user_id| self.send_notification(user_id, event.clone()))
            .sum()
    }

    /// Push a heartbeat everywhere so dead channels get pruned
    pub fn heartbeat(&self) -> usize {
        self.broadcast(PushEvent::new(
            "heartbeat",
            json!({ "timestamp": Utc::now() }),
        ))
    }

    /// Drop every channel; open streams end
    pub fn close_all(&self) {
        let closed: usize = self.channels.write().drain().map(|(_, user)| user.len()).sum();
        self.metrics.set_open_channels(0);
        if closed > 0 {
            info!(channels = closed, "Closed notification channels");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().values().map(HashMap::len).sum()
    }

    pub fn user_channel_count(&self, user_id: &str) -> usize {
        self.channels.read().get(user_id).map_or(0, HashMap::len)
    }

    fn deliver(
        &self,
        user_id: &str,
        targets: Vec<(Uuid, mpsc::Sender<PushEvent>)>,
        event: &PushEvent,
    ) -> usize {
        let mut delivered = 0;
        for (channel_id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let e = AppError::NotificationDelivery(format!("channel {} is full", channel_id));
                    warn!(user_id = %user_id, error = %e, event = %event.event, "Dropped notification");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let e = AppError::NotificationDelivery(format!("channel {} is closed", channel_id));
                    debug!(user_id = %user_id, error = %e, "Pruning notification channel");
                    self.unregister(user_id, channel_id);
                    self.metrics.inc_channels_pruned();
                }
            }
        }
        if delivered > 0 {
            self.metrics.inc_notifications_sent(delivered as u64);
        }
        delivered
    }
}

/// Unregisters its channel when dropped
struct ChannelGuard {
    hub: Weak<NotificationHub>,
    user_id: String,
    id: Uuid,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(&self.user_id, self.id);
        }
    }
}

/// Receiving side of one registered channel
pub struct NotificationChannel {
    id: Uuid,
    user_id: String,
    rx: mpsc::Receiver<PushEvent>,
    guard: ChannelGuard,
}

impl NotificationChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event, if any
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }

    /// Stream of events; dropping the stream closes the channel
    pub fn into_stream(self) -> impl Stream<Item = PushEvent> + Send + 'static {
        stream::unfold(
            (self.rx, self.guard),
            |(mut rx, guard)| async move { rx.recv().await.map(|event| (event, (rx, guard))) },
        )
    }
}

/// A push event addressed to one job's watchers
#[derive(Debug, Clone)]
pub struct JobPushEvent {
    pub job_id: Uuid,
    pub event: PushEvent,
}

/// Fan-out of per-job push events
#[derive(Clone)]
pub struct JobEventBus {
    tx: broadcast::Sender<JobPushEvent>,
}

impl JobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget; no watchers is fine
    pub fn publish(&self, job_id: Uuid, event: PushEvent) {
        let _ = self.tx.send(JobPushEvent { job_id, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobPushEvent> {
        self.tx.subscribe()
    }

    /// Events of one job. Lagged receivers skip ahead.
    pub fn watch(&self, job_id: Uuid) -> impl Stream<Item = PushEvent> + Send + 'static {
        stream::unfold(self.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(item) if item.job_id == job_id => return Some((item.event, rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(job_id = %job_id, lagged = count, "Job event watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;
    use futures_util::StreamExt;

    fn hub() -> Arc<NotificationHub> {
        NotificationHub::new(Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_send_to_user_without_channels_is_noop() {
        let hub = hub();
        let delivered = hub.send_notification("nobody", PushEvent::new("progress", json!({})));
        assert_eq!(delivered, 0);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_register_acknowledges_and_delivers() {
        let hub = hub();
        let mut first = hub.register("u1");
        let mut second = hub.register("u1");
        let mut other = hub.register("u2");

        for channel in [&mut first, &mut second, &mut other] {
            let ack = channel.recv().await.unwrap();
            assert_eq!(ack.event, "connected");
            assert_eq!(ack.retry, Some(RECONNECT_RETRY_MS));
        }

        let delivered = hub.send_notification("u1", PushEvent::new("progress", json!({"p": 10})));
        assert_eq!(delivered, 2);
        assert_eq!(first.recv().await.unwrap().data, json!({"p": 10}));
        assert_eq!(second.recv().await.unwrap().event, "progress");
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_channel_pruned_on_write() {
        let hub = hub();
        let alive = hub.register("u1");
        let dead = hub.register("u1");
        let NotificationChannel { rx, guard, .. } = dead;
        drop(rx);
        // Keep the guard alive so only the failed write can prune
        assert_eq!(hub.user_channel_count("u1"), 2);

        let delivered = hub.send_notification("u1", PushEvent::new("progress", json!({})));
        assert_eq!(delivered, 1);
        assert_eq!(hub.user_channel_count("u1"), 1);
        assert_eq!(hub.metrics.get_metrics().channels_pruned_total, 1);

        drop(guard);
        drop(alive);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_stream_unregisters() {
        let hub = hub();
        let mut stream = Box::pin(hub.register("u1").into_stream());
        assert_eq!(stream.next().await.unwrap().event, "connected");
        assert_eq!(hub.channel_count(), 1);
        drop(stream);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_and_broadcast_reach_everyone() {
        let hub = hub();
        let mut a = hub.register("u1");
        let mut b = hub.register("u2");
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        assert_eq!(hub.heartbeat(), 2);
        assert_eq!(a.recv().await.unwrap().event, "heartbeat");
        assert_eq!(b.recv().await.unwrap().event, "heartbeat");

        hub.close_all();
        assert_eq!(hub.channel_count(), 0);
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_notify_wraps_event() {
        let hub = hub();
        let mut channel = hub.register("u1");
        channel.recv().await.unwrap();

        let job_id = Uuid::new_v4();
        let event = NotificationEvent::new(job_id, NotificationKind::Failed, "u1", json!({"error": "boom"}));
        assert_eq!(hub.notify(&event), 1);

        let pushed = channel.recv().await.unwrap();
        assert_eq!(pushed.event, "notification");
        assert_eq!(pushed.id, Some(job_id.to_string()));
        assert_eq!(pushed.data["event_type"], json!("failed"));
    }

    #[tokio::test]
    async fn test_job_event_bus_filters_by_job() {
        let bus = JobEventBus::new(16);
        let job_id = Uuid::new_v4();
        let mut watcher = Box::pin(bus.watch(job_id));

        bus.publish(Uuid::new_v4(), PushEvent::new("progress", json!({"other": true})));
        bus.publish(job_id, PushEvent::new("progress", json!({"percentage": 10})));

        let event = watcher.next().await.unwrap();
        assert_eq!(event.data, json!({"percentage": 10}));
    }
}
