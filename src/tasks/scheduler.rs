//! Periodic retraining sweep over stale connections
//!
//! [`Schedule`] decides when to fire and holds no state; [`Scheduler`] owns
//! the single timer handle and runs the batched sweep when it fires or when
//! triggered by hand.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::models::{JobOptions, SchemaRebuildPayload, StaleConnection, SCHEMA_REBUILD_JOB};
use crate::routes::metrics::Metrics;
use crate::services::queue::JobQueue;
use crate::services::training::{NoProgress, TrainingPipeline, CACHE_TTL_DAYS};
use crate::store::SchemaCacheStore;

/// When the sweep fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a week at a fixed UTC time
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Fixed interval measured from the previous run
    Every(Duration),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Weekly {
            weekday: Weekday::Sun,
            hour: 0,
            minute: 0,
        }
    }
}

impl FromStr for Schedule {
    type Err = AppError;

    /// `weekly` or `every:<seconds>`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("weekly") {
            return Ok(Schedule::default());
        }
        if let Some(secs) = s.strip_prefix("every:") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| AppError::Validation(format!("Invalid schedule interval: {}", s)))?;
            if secs == 0 {
                return Err(AppError::Validation("Schedule interval must be positive".into()));
            }
            return Ok(Schedule::Every(Duration::from_secs(secs)));
        }
        Err(AppError::Validation(format!("Unknown schedule: {}", s)))
    }
}

impl Schedule {
    /// First firing moment strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::Every(interval) => {
                let step = ChronoDuration::from_std(interval)
                    .unwrap_or_else(|_| ChronoDuration::days(36_500));
                after.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (7 + weekday.num_days_from_monday() as i64
                    - after.weekday().num_days_from_monday() as i64)
                    % 7;
                let day = after.date_naive() + ChronoDuration::days(days_ahead);
                let at = day
                    .and_hms_opt(hour.min(23), minute.min(59), 0)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(after);
                if at > after {
                    at
                } else {
                    at + ChronoDuration::days(7)
                }
            }
        }
    }

    /// Whether a run is due at `now`, given the previous run (or the start
    /// of the timer when nothing ran yet)
    pub fn should_fire(&self, now: DateTime<Utc>, last_run: DateTime<Utc>) -> bool {
        now >= self.next_after(last_run)
    }
}

/// How one stale connection gets retrained
#[async_trait]
pub trait Retrainer: Send + Sync {
    async fn retrain(&self, connection: &StaleConnection) -> Result<()>;
}

fn rebuild_payload(connection: &StaleConnection) -> SchemaRebuildPayload {
    SchemaRebuildPayload {
        connection_id: connection.connection_id.clone(),
        user_id: connection.user_id.clone(),
        force: true,
        selection: None,
        metadata: Default::default(),
    }
}

/// Enqueues a schema rebuild job; the worker does the training
pub struct QueueRetrainer {
    queue: Arc<JobQueue>,
}

impl QueueRetrainer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Retrainer for QueueRetrainer {
    async fn retrain(&self, connection: &StaleConnection) -> Result<()> {
        let payload = serde_json::to_value(rebuild_payload(connection))?;
        let inserted = self
            .queue
            .create(SCHEMA_REBUILD_JOB, payload, JobOptions::default())
            .await?;
        debug!(
            connection_id = %connection.connection_id,
            job_id = %inserted.job().id,
            created = inserted.is_created(),
            "Scheduled schema rebuild"
        );
        Ok(())
    }
}

/// Trains in the sweep itself
pub struct InlineRetrainer {
    pipeline: Arc<TrainingPipeline>,
}

impl InlineRetrainer {
    pub fn new(pipeline: Arc<TrainingPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Retrainer for InlineRetrainer {
    async fn retrain(&self, connection: &StaleConnection) -> Result<()> {
        self.pipeline
            .retrain(&rebuild_payload(connection), &NoProgress)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepError {
    pub connection_id: String,
    pub error: String,
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<SweepError>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub schedule: Schedule,
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Caches older than this are retrained
    pub staleness: ChronoDuration,
    /// How often the timer checks whether the schedule is due
    pub tick: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            schedule: Schedule::default(),
            batch_size: 5,
            batch_delay: Duration::from_secs(5),
            staleness: ChronoDuration::days(CACHE_TTL_DAYS),
            tick: Duration::from_secs(30),
        }
    }
}

pub struct Scheduler {
    caches: Arc<dyn SchemaCacheStore>,
    retrainer: Arc<dyn Retrainer>,
    options: SchedulerOptions,
    metrics: Arc<Metrics>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes sweeps so a manual trigger never overlaps a scheduled run
    sweep_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(
        caches: Arc<dyn SchemaCacheStore>,
        retrainer: Arc<dyn Retrainer>,
        options: SchedulerOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            caches,
            retrainer,
            options,
            metrics,
            handle: Mutex::new(None),
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Start the periodic timer. Returns false when it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Scheduler already running");
            return false;
        }

        let scheduler = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { scheduler.run_timer().await }));
        info!(schedule = ?self.options.schedule, "Scheduler started");
        true
    }

    /// Stop the timer. A sweep in progress is aborted with it.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run one sweep now
    pub async fn trigger(&self) -> Result<SweepSummary> {
        info!("Manual schema sweep triggered");
        self.sweep().await
    }

    async fn run_timer(&self) {
        let mut last_run = Utc::now();
        let tick = match self.options.schedule {
            Schedule::Every(interval) => interval.min(self.options.tick),
            Schedule::Weekly { .. } => self.options.tick,
        };
        let mut interval = tokio::time::interval(tick);
        info!(next_run = %self.options.schedule.next_after(last_run), "Schema sweep scheduled");

        loop {
            interval.tick().await;
            let now = Utc::now();
            if !self.options.schedule.should_fire(now, last_run) {
                continue;
            }
            last_run = now;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Scheduled schema sweep failed");
            }
            info!(next_run = %self.options.schedule.next_after(last_run), "Schema sweep scheduled");
        }
    }

    /// Retrain every stale connection in fixed-size batches.
    /// Per-connection failures are recorded in the summary, never raised.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let _guard = self.sweep_lock.lock().await;
        let started = Instant::now();
        let threshold = Utc::now() - self.options.staleness;
        let stale = self.caches.list_stale_connections(threshold).await?;
        info!(count = stale.len(), "Starting schema sweep");

        let mut summary = SweepSummary {
            total: stale.len(),
            successful: 0,
            failed: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        let batch_size = self.options.batch_size.max(1);
        let batches: Vec<&[StaleConnection]> = stale.chunks(batch_size).collect();
        for (index, batch) in batches.iter().enumerate() {
            if index > 0 && !self.options.batch_delay.is_zero() {
                tokio::time::sleep(self.options.batch_delay).await;
            }

            let results = join_all(batch.iter().map(|conn| self.retrainer.retrain(conn))).await;
            for (conn, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => summary.successful += 1,
                    Err(e) => {
                        warn!(connection_id = %conn.connection_id, error = %e, "Schema retrain failed");
                        summary.failed += 1;
                        summary.errors.push(SweepError {
                            connection_id: conn.connection_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            debug!(batch = index + 1, batches = batches.len(), "Sweep batch finished");
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.inc_sweeps();
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            errors = %json!(summary.errors),
            "Schema sweep finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredConnection;
    use crate::store::{ConnectionStore, MemoryStore};
    use std::collections::HashSet;

    struct FailSome {
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Retrainer for FailSome {
        async fn retrain(&self, connection: &StaleConnection) -> Result<()> {
            self.calls.lock().push(connection.connection_id.clone());
            if self.failing.contains(&connection.connection_id) {
                return Err(AppError::Connection(format!(
                    "{} unreachable",
                    connection.connection_id
                )));
            }
            Ok(())
        }
    }

    /// Records when each connection was retrained
    struct Timed(Mutex<Vec<(String, Instant)>>);

    #[async_trait]
    impl Retrainer for Timed {
        async fn retrain(&self, connection: &StaleConnection) -> Result<()> {
            self.0.lock().push((connection.connection_id.clone(), Instant::now()));
            Ok(())
        }
    }

    async fn store_with(count: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..count {
            store
                .save_connection(&StoredConnection {
                    id: format!("conn-{:02}", i),
                    user_id: "u1".into(),
                    name: format!("db {}", i),
                    config: json!({"type": "sqlite", "path": ":memory:"}),
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_sweep_waits_between_batches() {
        let store = store_with(12).await;
        let retrainer = Arc::new(Timed(Mutex::new(Vec::new())));
        let delay = Duration::from_millis(200);
        let scheduler = Scheduler::new(
            store,
            retrainer.clone(),
            SchedulerOptions {
                batch_size: 5,
                batch_delay: delay,
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        );

        let started = Instant::now();
        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.successful, 12);
        // Three batches, two pauses
        assert!(started.elapsed() >= delay * 2);

        let calls = retrainer.0.lock().clone();
        let batch_start = |n: usize| calls[n * 5].1;
        assert!(batch_start(1) - batch_start(0) >= delay);
        assert!(batch_start(2) - batch_start(1) >= delay);
        assert!(calls[4].1 - batch_start(0) < delay);
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_isolates_failures() {
        let store = store_with(12).await;
        let retrainer = Arc::new(FailSome {
            failing: ["conn-02", "conn-06", "conn-11"].iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(
            store,
            retrainer.clone(),
            SchedulerOptions {
                batch_size: 5,
                batch_delay: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        );

        let summary = scheduler.trigger().await.unwrap();
        assert_eq!(summary.total, 12);
        assert_eq!(summary.successful, 9);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.errors.len(), 3);
        assert_eq!(retrainer.calls.lock().len(), 12);
        let mut failed: Vec<_> = summary.errors.iter().map(|e| e.connection_id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["conn-02", "conn-06", "conn-11"]);
    }

    #[tokio::test]
    async fn test_queue_retrainer_dedups_pending_jobs() {
        use crate::services::queue::QueueDefaults;

        let store = store_with(2).await;
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(JobQueue::new(store.clone(), QueueDefaults::default(), metrics.clone()));
        let scheduler = Scheduler::new(
            store,
            Arc::new(QueueRetrainer::new(queue.clone())),
            SchedulerOptions {
                batch_delay: Duration::ZERO,
                ..Default::default()
            },
            metrics.clone(),
        );

        assert_eq!(scheduler.trigger().await.unwrap().successful, 2);
        assert_eq!(scheduler.trigger().await.unwrap().successful, 2);
        assert_eq!(queue.stats().await.unwrap().created, 2);
        assert_eq!(metrics.get_metrics().sweeps_total, 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_clears() {
        let scheduler = Arc::new(Scheduler::new(
            store_with(0).await,
            Arc::new(FailSome {
                failing: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }),
            SchedulerOptions::default(),
            Arc::new(Metrics::new()),
        ));

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(scheduler.start());
        scheduler.stop();
    }

    #[test]
    fn test_weekly_next_after() {
        let schedule = Schedule::default();
        // 2026-10-14 is a Wednesday
        assert_eq!(schedule.next_after(at(2026, 10, 14, 9, 30)), at(2026, 10, 18, 0, 0));
        // Exactly on the mark moves to the following week
        assert_eq!(schedule.next_after(at(2026, 10, 18, 0, 0)), at(2026, 10, 25, 0, 0));
        assert_eq!(schedule.next_after(at(2026, 10, 18, 0, 1)), at(2026, 10, 25, 0, 0));
    }

    #[test]
    fn test_should_fire() {
        let weekly = Schedule::default();
        let last = at(2026, 10, 14, 9, 30);
        assert!(!weekly.should_fire(at(2026, 10, 17, 23, 59), last));
        assert!(weekly.should_fire(at(2026, 10, 18, 0, 0), last));

        let every = Schedule::Every(Duration::from_secs(600));
        assert!(!every.should_fire(at(2026, 10, 14, 9, 39), last));
        assert!(every.should_fire(at(2026, 10, 14, 9, 40), last));
    }

    #[test]
    fn test_parse_schedule() {
        assert_eq!("weekly".parse::<Schedule>().unwrap(), Schedule::default());
        assert_eq!(
            "every:3600".parse::<Schedule>().unwrap(),
            Schedule::Every(Duration::from_secs(3600))
        );
        assert!("every:0".parse::<Schedule>().is_err());
        assert!("0 0 * * 0".parse::<Schedule>().is_err());
    }
}
