//! Durable job queue
//!
//! State machine: `created -> active -> completed`, `active -> retry ->
//! active ... -> failed`, `created|retry|active -> cancelled`, and
//! `created|retry -> expired` when nobody claims the job in time. An active
//! attempt that outlives the same window is treated as a failed attempt.
//! Every transition out of `active` is a compare-and-set, so a job cancelled
//! while its handler runs stays cancelled.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Job, JobFilter, JobOptions, JobPage, JobProgress, JobState, JobStats, SchemaRebuildPayload,
    SCHEMA_REBUILD_JOB,
};
use crate::routes::metrics::Metrics;
use crate::store::{JobInsert, JobStore};

/// Largest backoff exponent; keeps the delay arithmetic bounded
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Upper bound for `expire_in_secs` and `retry_delay_secs` (one year)
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Error recorded on an active attempt that outlived its window
pub const ABANDONED_ERROR: &str = "Job attempt expired while active";

/// Retry and expiry policy used when a job does not override it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefaults {
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: bool,
    pub expire_in_secs: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay_secs: 30,
            retry_backoff: true,
            expire_in_secs: 900,
        }
    }
}

/// What happened to a job after its handler failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt
    Retrying {
        attempt: u32,
        start_after: DateTime<Utc>,
    },
    /// Retries exhausted
    Failed,
    /// The job left `active` (cancelled) before the failure was recorded
    Superseded,
}

/// Dedup key shared by all rebuilds of one connection
pub fn schema_rebuild_key(connection_id: &str) -> String {
    format!("{}:{}", SCHEMA_REBUILD_JOB, connection_id)
}

/// Delay before attempt `retry_count` (1-based) of a failed job
pub fn retry_delay(delay_secs: u64, backoff: bool, retry_count: u32) -> Duration {
    let factor = if backoff {
        1u64 << retry_count.saturating_sub(1).min(MAX_BACKOFF_EXPONENT)
    } else {
        1
    };
    Duration::seconds(delay_secs.saturating_mul(factor).min(i64::MAX as u64 / 1000) as i64)
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    defaults: QueueDefaults,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, defaults: QueueDefaults, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            defaults,
            metrics,
        }
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// Validate and enqueue a job. A live job with the same dedup key is
    /// returned instead of creating a second one.
    pub async fn create(&self, job_type: &str, payload: Value, options: JobOptions) -> Result<JobInsert> {
        let job_type = job_type.trim();
        if job_type.is_empty() {
            return Err(AppError::Validation("Job type must not be empty".into()));
        }
        if !payload.is_object() {
            return Err(AppError::Validation("Job payload must be a JSON object".into()));
        }

        let mut singleton_key = options.singleton_key.filter(|k| !k.is_empty());
        if job_type == SCHEMA_REBUILD_JOB {
            let parsed: SchemaRebuildPayload = serde_json::from_value(payload.clone())?;
            if parsed.connection_id.trim().is_empty() || parsed.user_id.trim().is_empty() {
                return Err(AppError::Validation(
                    "Schema rebuild requires connection_id and user_id".into(),
                ));
            }
            singleton_key.get_or_insert_with(|| schema_rebuild_key(&parsed.connection_id));
        }

        let expire_in = options.expire_in_secs.unwrap_or(self.defaults.expire_in_secs);
        if expire_in > MAX_WINDOW_SECS {
            return Err(AppError::Validation(format!(
                "expire_in_secs must be at most {}",
                MAX_WINDOW_SECS
            )));
        }
        let retry_delay_secs = options
            .retry_delay_secs
            .unwrap_or(self.defaults.retry_delay_secs);
        if retry_delay_secs > MAX_WINDOW_SECS {
            return Err(AppError::Validation(format!(
                "retry_delay_secs must be at most {}",
                MAX_WINDOW_SECS
            )));
        }

        let now = Utc::now();
        let start_after = options.start_after.unwrap_or(now).max(now);
        let expire_at = if expire_in > 0 {
            let at = start_after
                .checked_add_signed(Duration::seconds(expire_in as i64))
                .ok_or_else(|| AppError::Validation("start_after is out of range".into()))?;
            Some(at)
        } else {
            None
        };
        let job = Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            state: JobState::Created,
            priority: options.priority.unwrap_or(0),
            retry_limit: options.retry_limit.unwrap_or(self.defaults.retry_limit),
            retry_count: 0,
            retry_delay_secs,
            retry_backoff: options.retry_backoff.unwrap_or(self.defaults.retry_backoff),
            start_after,
            expire_at,
            singleton_key,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress: None,
            output: None,
            error: None,
            retry_of: None,
        };

        let inserted = self.store.insert_job(job).await?;
        let job = inserted.job();
        if inserted.is_created() {
            self.metrics.inc_jobs_created();
            info!(job_id = %job.id, job_type = %job.job_type, priority = job.priority, "Job created");
        } else {
            info!(job_id = %job.id, job_type = %job.job_type, "Duplicate job suppressed by dedup key");
        }
        Ok(inserted)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job not found: {}", id)))
    }

    pub async fn list(&self, filter: JobFilter) -> Result<JobPage> {
        self.store.list_jobs(&filter.normalized()).await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        self.store.job_stats().await
    }

    /// Cancel a queued or running job. Running handlers notice at their next stage boundary.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        loop {
            let mut job = self.get(id).await?;
            if !matches!(job.state, JobState::Created | JobState::Retry | JobState::Active) {
                return Err(AppError::Validation(format!(
                    "Cannot cancel job {} in state {}",
                    id, job.state
                )));
            }
            let from = job.state;
            job.state = JobState::Cancelled;
            job.completed_at = Some(Utc::now());
            if self.store.update_job_if(&job, &[from]).await? {
                info!(job_id = %id, from = %from, "Job cancelled");
                return Ok(job);
            }
        }
    }

    /// Spawn a fresh job from a failed, cancelled, or expired one
    pub async fn retry(&self, id: Uuid) -> Result<JobInsert> {
        let original = self.get(id).await?;
        if !matches!(
            original.state,
            JobState::Failed | JobState::Cancelled | JobState::Expired
        ) {
            return Err(AppError::Validation(format!(
                "Cannot retry job {} in state {}",
                id, original.state
            )));
        }

        let now = Utc::now();
        let window = original.expire_at.map(|at| at - original.start_after);
        let job = Job {
            id: Uuid::new_v4(),
            state: JobState::Created,
            retry_count: 0,
            start_after: now,
            expire_at: window.map(|w| now.checked_add_signed(w).unwrap_or(DateTime::<Utc>::MAX_UTC)),
            created_at: now,
            started_at: None,
            completed_at: None,
            progress: None,
            output: None,
            error: None,
            retry_of: Some(original.id),
            ..original
        };

        let inserted = self.store.insert_job(job).await?;
        if inserted.is_created() {
            self.metrics.inc_jobs_created();
            info!(job_id = %inserted.job().id, retry_of = %id, "Job re-queued");
        }
        Ok(inserted)
    }

    /// Claim due jobs of one type
    pub async fn fetch(&self, job_type: &str, limit: usize) -> Result<Vec<Job>> {
        self.store.fetch_next(job_type, limit, Utc::now()).await
    }

    /// Record progress of an active job; `false` once the job left `active`
    pub async fn progress(&self, id: Uuid, progress: &JobProgress) -> Result<bool> {
        self.store.update_progress(id, progress).await
    }

    pub async fn complete(&self, job: &Job, output: Value) -> Result<bool> {
        let mut done = job.clone();
        done.state = JobState::Completed;
        done.completed_at = Some(Utc::now());
        done.output = Some(output);
        done.error = None;

        let applied = self.store.update_job_if(&done, &[JobState::Active]).await?;
        if applied {
            self.metrics.inc_jobs_completed();
            info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
        } else {
            warn!(job_id = %job.id, "Job left active state before completion was recorded");
        }
        Ok(applied)
    }

    /// Apply the retry policy to a failed attempt
    pub async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut next = job.clone();
        next.error = Some(error.to_string());

        let outcome = if job.retry_count < job.retry_limit {
            next.retry_count = job.retry_count + 1;
            next.state = JobState::Retry;
            next.start_after = now
                .checked_add_signed(retry_delay(job.retry_delay_secs, job.retry_backoff, next.retry_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            next.expire_at = job.expire_at.map(|at| {
                next.start_after
                    .checked_add_signed(at - job.start_after)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            });
            FailOutcome::Retrying {
                attempt: next.retry_count,
                start_after: next.start_after,
            }
        } else {
            next.state = JobState::Failed;
            next.completed_at = Some(now);
            FailOutcome::Failed
        };

        if !self.store.update_job_if(&next, &[JobState::Active]).await? {
            return Ok(FailOutcome::Superseded);
        }
        match &outcome {
            FailOutcome::Retrying { attempt, start_after } => {
                self.metrics.inc_jobs_retried();
                warn!(
                    job_id = %job.id,
                    attempt = attempt,
                    retry_limit = job.retry_limit,
                    start_after = %start_after,
                    error = %error,
                    "Job failed, retry scheduled"
                );
            }
            _ => {
                self.metrics.inc_jobs_failed();
                warn!(job_id = %job.id, retries = job.retry_count, error = %error, "Job failed permanently");
            }
        }
        Ok(outcome)
    }

    /// Whether the job has been cancelled (or otherwise left `active`)
    pub async fn is_cancelled(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id).await?.state != JobState::Active)
    }

    /// Expire queued jobs nobody claimed in time, and fail active attempts
    /// that outlived their window (their worker is gone) so the retry policy
    /// and the dedup key are released again. Returns how many jobs moved.
    pub async fn expire(&self) -> Result<u64> {
        let now = Utc::now();
        let mut moved = self.store.expire_jobs(now).await?;
        for job in self.store.overdue_active_jobs(now).await? {
            match self.fail(&job, ABANDONED_ERROR).await? {
                FailOutcome::Superseded => {}
                outcome => {
                    warn!(job_id = %job.id, job_type = %job.job_type, ?outcome, "Recovered abandoned job");
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }
}
