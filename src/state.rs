//! Application state shared across handlers

use crate::config::SchedulerMode;
use crate::connectors::registry::ConnectorRegistry;
use crate::routes::metrics::Metrics;
use crate::services::notifications::{JobEventBus, NotificationHub};
use crate::services::queue::{JobQueue, QueueDefaults};
use crate::services::training::TrainingPipeline;
use crate::services::worker::JobHandler;
use crate::store::Stores;
use crate::tasks::schema_rebuild::SchemaRebuildHandler;
use crate::tasks::scheduler::{InlineRetrainer, QueueRetrainer, Retrainer, Scheduler, SchedulerOptions};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Persistence backends
    pub stores: Stores,
    /// Durable job queue
    pub queue: Arc<JobQueue>,
    /// Live connectors by connection id
    pub registry: Arc<ConnectorRegistry>,
    pub pipeline: Arc<TrainingPipeline>,
    /// Per-user notification channels
    pub hub: Arc<NotificationHub>,
    /// Per-job push events
    pub events: JobEventBus,
    pub scheduler: Arc<Scheduler>,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire every component on top of the given stores
    ///
    /// # Arguments
    /// * `stores` - Persistence backends
    /// * `queue_defaults` - Retry and expiry defaults for new jobs
    /// * `scheduler_mode` - Whether sweeps enqueue jobs or train inline
    /// * `scheduler_options` - Sweep schedule and batching
    /// * `event_bus_capacity` - Capacity of the per-job push channel
    pub fn new(
        stores: Stores,
        queue_defaults: QueueDefaults,
        scheduler_mode: SchedulerMode,
        scheduler_options: SchedulerOptions,
        event_bus_capacity: usize,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(JobQueue::new(stores.jobs.clone(), queue_defaults, metrics.clone()));
        let registry = Arc::new(ConnectorRegistry::new(stores.connections.clone()));
        let pipeline = Arc::new(TrainingPipeline::new(registry.clone(), stores.caches.clone()));
        let retrainer: Arc<dyn Retrainer> = match scheduler_mode {
            SchedulerMode::Enqueue => Arc::new(QueueRetrainer::new(queue.clone())),
            SchedulerMode::Inline => Arc::new(InlineRetrainer::new(pipeline.clone())),
        };
        let scheduler = Arc::new(Scheduler::new(
            stores.caches.clone(),
            retrainer,
            scheduler_options,
            metrics.clone(),
        ));

        Self {
            stores,
            queue,
            registry,
            pipeline,
            hub: NotificationHub::new(metrics.clone()),
            events: JobEventBus::new(event_bus_capacity),
            scheduler,
            metrics,
        }
    }

    /// In-process store with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Stores::memory(),
            QueueDefaults::default(),
            SchedulerMode::Enqueue,
            SchedulerOptions::default(),
            1024,
        )
    }

    /// Handler for schema rebuild jobs
    pub fn schema_rebuild_handler(&self) -> Arc<dyn JobHandler> {
        Arc::new(SchemaRebuildHandler::new(
            self.pipeline.clone(),
            self.hub.clone(),
            self.events.clone(),
        ))
    }
}
