//! Worker runtime
//!
//! Each registered job type gets `team_size` slots. A slot polls the queue,
//! claims up to `team_concurrency` jobs and runs them side by side, each in
//! its own task (so a panicking handler only fails its job), and records
//! completion or failure with compare-and-set writes.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Job, JobProgress};
use crate::services::queue::{FailOutcome, JobQueue};

/// Handler for one job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<Value>;
}

/// Per-job handle given to handlers for progress and cancellation checks
#[derive(Clone)]
pub struct JobContext {
    queue: Arc<JobQueue>,
    job_id: Uuid,
    last_percentage: Arc<AtomicU8>,
}

impl JobContext {
    pub fn new(queue: Arc<JobQueue>, job_id: Uuid) -> Self {
        Self {
            queue,
            job_id,
            last_percentage: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Fail with `JobCancelled` once the job is no longer active
    pub async fn check_cancelled(&self) -> Result<()> {
        if self.queue.is_cancelled(self.job_id).await? {
            return Err(AppError::JobCancelled(self.job_id));
        }
        Ok(())
    }

    /// Store progress. Percentages never go backwards; a job that left
    /// `active` surfaces as `JobCancelled`.
    pub async fn progress(&self, progress: JobProgress) -> Result<()> {
        let previous = self
            .last_percentage
            .fetch_max(progress.percentage, Ordering::SeqCst);
        if progress.percentage < previous {
            debug!(job_id = %self.job_id, percentage = progress.percentage, "Ignoring regressing progress");
            return Ok(());
        }
        if !self.queue.progress(self.job_id, &progress).await? {
            return Err(AppError::JobCancelled(self.job_id));
        }
        Ok(())
    }
}

/// Concurrency and polling for one registered job type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Slots running this job type in parallel
    pub team_size: usize,
    /// Jobs per slot at a time
    pub team_concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            team_size: 3,
            team_concurrency: 1,
            poll_interval: Duration::from_secs(2),
        }
    }
}

struct Registration {
    job_type: String,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
}

pub struct Worker {
    queue: Arc<JobQueue>,
    registrations: Vec<Registration>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            registrations: Vec::new(),
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>, options: WorkerOptions) {
        info!(
            job_type = %job_type,
            team_size = options.team_size,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Worker registered"
        );
        self.registrations.push(Registration {
            job_type: job_type.to_string(),
            handler,
            options,
        });
    }

    /// Spawn the polling slots of every registration
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            warn!("Worker already started");
            return;
        }
        for registration in &self.registrations {
            for slot in 0..registration.options.team_size.max(1) {
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&registration.handler);
                let job_type = registration.job_type.clone();
                let options = registration.options.clone();
                let shutdown = self.shutdown_tx.subscribe();
                self.tasks.push(tokio::spawn(slot_loop(
                    queue, job_type, handler, options, slot, shutdown,
                )));
            }
        }
        info!(slots = self.tasks.len(), "Worker started");
    }

    /// Stop polling and wait for running jobs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker slot terminated abnormally");
            }
        }
        info!("Worker stopped");
    }
}

async fn slot_loop(
    queue: Arc<JobQueue>,
    job_type: String,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
    slot: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(options.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!(job_type = %job_type, slot = slot, "Worker slot polling");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        // Drain due work before waiting for the next tick
        loop {
            match process_next(&queue, &job_type, &handler, options.team_concurrency).await {
                Ok(0) => break,
                Ok(_) if *shutdown.borrow() => break,
                Ok(_) => continue,
                Err(e) => {
                    error!(job_type = %job_type, slot = slot, error = %e, "Failed to poll queue");
                    break;
                }
            }
        }
    }
    debug!(job_type = %job_type, slot = slot, "Worker slot stopped");
}

/// Claim up to `limit` due jobs of one type and run them concurrently;
/// returns how many ran
pub async fn process_next(
    queue: &Arc<JobQueue>,
    job_type: &str,
    handler: &Arc<dyn JobHandler>,
    limit: usize,
) -> Result<usize> {
    let jobs = queue.fetch(job_type, limit.max(1)).await?;
    let count = jobs.len();
    let results = join_all(jobs.into_iter().map(|job| run_job(queue, handler, job))).await;
    // A job whose outcome could not be stored stays active until expiry recovers it
    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(count)
}

async fn run_job(queue: &Arc<JobQueue>, handler: &Arc<dyn JobHandler>, job: Job) -> Result<()> {
    let job_id = job.id;
    info!(job_id = %job_id, job_type = %job.job_type, attempt = job.retry_count + 1, "Job started");

    let ctx = JobContext::new(Arc::clone(queue), job_id);
    let task = {
        let handler = Arc::clone(handler);
        let job = job.clone();
        tokio::spawn(async move { handler.handle(job, ctx).await })
    };

    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(AppError::JobExecution(format!("Handler panicked: {}", e))),
    };

    match result {
        Ok(output) => {
            queue.complete(&job, output).await?;
        }
        Err(AppError::JobCancelled(_)) => {
            info!(job_id = %job_id, "Job stopped after cancellation");
        }
        Err(e) => match queue.fail(&job, &e.to_string()).await? {
            FailOutcome::Superseded => {
                info!(job_id = %job_id, error = %e, "Job failed after leaving active state");
            }
            FailOutcome::Retrying { .. } | FailOutcome::Failed => {}
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobOptions, JobState};
    use crate::routes::metrics::Metrics;
    use crate::services::queue::QueueDefaults;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;

    fn queue(retry_limit: u32) -> Arc<JobQueue> {
        Arc::new(JobQueue::new(
            Arc::new(MemoryStore::new()),
            QueueDefaults {
                retry_limit,
                retry_delay_secs: 0,
                retry_backoff: false,
                expire_in_secs: 900,
            },
            Arc::new(Metrics::new()),
        ))
    }

    struct Steps(Mutex<Vec<u8>>);

    #[async_trait]
    impl JobHandler for Steps {
        async fn handle(&self, _job: Job, ctx: JobContext) -> Result<Value> {
            for pct in [10u8, 50, 30, 100] {
                ctx.progress(JobProgress::new(pct as u64, 100, "step")).await?;
                self.0.lock().push(pct);
            }
            Ok(json!({"done": true}))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn handle(&self, _job: Job, _ctx: JobContext) -> Result<Value> {
            Err(AppError::JobExecution("always".into()))
        }
    }

    /// Completes only once `n` jobs are inside the handler at the same time
    struct Rendezvous(tokio::sync::Barrier);

    #[async_trait]
    impl JobHandler for Rendezvous {
        async fn handle(&self, job: Job, ctx: JobContext) -> Result<Value> {
            ctx.progress(JobProgress::new(10, 100, "waiting")).await?;
            self.0.wait().await;
            Ok(json!({"id": job.id}))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _job: Job, _ctx: JobContext) -> Result<Value> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let q = queue(0);
        let job = q.create("steps", json!({}), JobOptions::default()).await.unwrap().into_job();
        let steps = Arc::new(Steps(Mutex::new(Vec::new())));
        let handler: Arc<dyn JobHandler> = steps.clone();

        assert_eq!(process_next(&q, "steps", &handler, 1).await.unwrap(), 1);
        let stored = q.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.output, Some(json!({"done": true})));
        assert_eq!(stored.progress.unwrap().percentage, 100);
        assert_eq!(*steps.0.lock(), vec![10, 50, 30, 100]);
    }

    #[tokio::test]
    async fn test_failing_handler_retries_until_failed() {
        let q = queue(2);
        let job = q.create("bad", json!({}), JobOptions::default()).await.unwrap().into_job();
        let handler: Arc<dyn JobHandler> = Arc::new(AlwaysFails);

        for _ in 0..3 {
            assert_eq!(process_next(&q, "bad", &handler, 1).await.unwrap(), 1);
        }
        let stored = q.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.retry_count, 2);
        assert!(stored.error.unwrap().contains("always"));
        assert_eq!(process_next(&q, "bad", &handler, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_only_its_job() {
        let q = queue(0);
        let job = q.create("panic", json!({}), JobOptions::default()).await.unwrap().into_job();
        let handler: Arc<dyn JobHandler> = Arc::new(Panics);

        assert_eq!(process_next(&q, "panic", &handler, 1).await.unwrap(), 1);
        let stored = q.get(job.id).await.unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_claimed_batch_runs_concurrently() {
        let q = queue(0);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(q.create("pair", json!({}), JobOptions::default()).await.unwrap().into_job().id);
        }
        let handler: Arc<dyn JobHandler> = Arc::new(Rendezvous(tokio::sync::Barrier::new(3)));

        let ran = tokio::time::timeout(Duration::from_secs(5), process_next(&q, "pair", &handler, 3))
            .await
            .expect("claimed jobs ran one after another")
            .unwrap();
        assert_eq!(ran, 3);
        for id in ids {
            assert_eq!(q.get(id).await.unwrap().state, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn test_progress_after_cancel_stops_job() {
        let q = queue(0);
        q.create("steps", json!({}), JobOptions::default()).await.unwrap();
        let job = q.fetch("steps", 1).await.unwrap().remove(0);
        let ctx = JobContext::new(Arc::clone(&q), job.id);

        ctx.progress(JobProgress::new(10, 100, "")).await.unwrap();
        q.cancel(job.id).await.unwrap();
        assert!(matches!(
            ctx.progress(JobProgress::new(30, 100, "")).await,
            Err(AppError::JobCancelled(_))
        ));
        assert!(matches!(ctx.check_cancelled().await, Err(AppError::JobCancelled(_))));
    }

    #[tokio::test]
    async fn test_started_worker_processes_and_shuts_down() {
        let q = queue(0);
        let job = q.create("steps", json!({}), JobOptions::default()).await.unwrap().into_job();

        let mut worker = Worker::new(Arc::clone(&q));
        worker.register(
            "steps",
            Arc::new(Steps(Mutex::new(Vec::new()))),
            WorkerOptions {
                team_size: 2,
                team_concurrency: 1,
                poll_interval: Duration::from_millis(10),
            },
        );
        worker.start();

        let mut state = JobState::Created;
        for _ in 0..200 {
            state = q.get(job.id).await.unwrap().state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown().await;
        assert_eq!(state, JobState::Completed);
    }
}
