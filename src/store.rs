//! Persistence traits for jobs, schema caches, and registered connections
//!
//! [`crate::db::Database`] implements them on Postgres. [`MemoryStore`]
//! keeps everything in-process for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Job, JobFilter, JobPage, JobProgress, JobState, JobStats, SchemaCacheRecord, StaleConnection,
    StoredConnection, TrainingStatus,
};

/// Outcome of inserting a job that may carry a dedup key
#[derive(Debug, Clone)]
pub enum JobInsert {
    Created(Job),
    /// A non-terminal job with the same type and dedup key already exists
    Existing(Job),
}

impl JobInsert {
    pub fn job(&self) -> &Job {
        match self {
            JobInsert::Created(job) | JobInsert::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            JobInsert::Created(job) | JobInsert::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, JobInsert::Created(_))
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: Job) -> Result<JobInsert>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Claim up to `limit` due jobs of one type, moving them to `active`.
    /// Highest priority first, then oldest.
    async fn fetch_next(&self, job_type: &str, limit: usize, now: DateTime<Utc>)
        -> Result<Vec<Job>>;

    /// Overwrite the job only if its stored state is one of `expected`.
    /// Progress is left alone; it only changes through `update_progress`.
    async fn update_job_if(&self, job: &Job, expected: &[JobState]) -> Result<bool>;

    /// Record progress. Ignored unless the job is active.
    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> Result<bool>;

    /// Expire queued jobs whose expiry has passed; returns how many
    async fn expire_jobs(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Active jobs whose attempt outlived its expiry window
    /// (see [`Job::active_deadline`])
    async fn overdue_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    async fn job_stats(&self) -> Result<JobStats>;

    async fn health_check(&self) -> Result<()>;
}

#[async_trait]
pub trait SchemaCacheStore: Send + Sync {
    async fn get_schema_cache(&self, connection_id: &str) -> Result<Option<SchemaCacheRecord>>;

    async fn upsert_schema_cache(&self, record: &SchemaCacheRecord) -> Result<()>;

    /// Update the status of an existing cache record; missing records are left alone
    async fn set_training_status(&self, connection_id: &str, status: TrainingStatus) -> Result<()>;

    /// Registered connections with no cache or a cache trained before `threshold`
    async fn list_stale_connections(&self, threshold: DateTime<Utc>)
        -> Result<Vec<StaleConnection>>;
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get_connection(&self, id: &str) -> Result<Option<StoredConnection>>;

    async fn save_connection(&self, connection: &StoredConnection) -> Result<()>;
}

/// The three persistence seams, usually backed by one object
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub caches: Arc<dyn SchemaCacheStore>,
    pub connections: Arc<dyn ConnectionStore>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: JobStore + SchemaCacheStore + ConnectionStore + 'static,
    {
        Self {
            jobs: backend.clone(),
            caches: backend.clone(),
            connections: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryStore::new()))
    }
}

#[derive(Default)]
struct MemoryInner {
    jobs: HashMap<Uuid, Job>,
    caches: HashMap<String, SchemaCacheRecord>,
    connections: HashMap<String, StoredConnection>,
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(&self, job: Job) -> Result<JobInsert> {
        let mut inner = self.inner.lock();
        if let Some(key) = &job.singleton_key {
            let existing = inner.jobs.values().find(|j| {
                j.job_type == job.job_type
                    && j.singleton_key.as_ref() == Some(key)
                    && !j.state.is_terminal()
            });
            if let Some(existing) = existing {
                return Ok(JobInsert::Existing(existing.clone()));
            }
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(JobInsert::Created(job))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let inner = self.inner.lock();
        let mut matching: Vec<&Job> = inner.jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.per_page as usize)
            .cloned()
            .collect();
        Ok(JobPage {
            jobs,
            total,
            page: filter.page,
            per_page: filter.per_page,
        })
    }

    async fn fetch_next(
        &self,
        job_type: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock();
        let mut due: Vec<&mut Job> = inner
            .jobs
            .values_mut()
            .filter(|j| {
                j.job_type == job_type
                    && j.state.is_queued()
                    && j.start_after <= now
                    && j.expire_at.map_or(true, |at| at > now)
            })
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Active;
                job.started_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn update_job_if(&self, job: &Job, expected: &[JobState]) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&job.id) {
            Some(stored) if expected.contains(&stored.state) => {
                let progress = stored.progress.take();
                *stored = job.clone();
                stored.progress = progress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Active => {
                job.progress = Some(progress.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_jobs(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut expired = 0;
        for job in inner.jobs.values_mut() {
            if job.state.is_queued() && job.expire_at.is_some_and(|at| at <= now) {
                job.state = JobState::Expired;
                job.completed_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn overdue_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Active && j.active_deadline().is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn job_stats(&self) -> Result<JobStats> {
        let inner = self.inner.lock();
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SchemaCacheStore for MemoryStore {
    async fn get_schema_cache(&self, connection_id: &str) -> Result<Option<SchemaCacheRecord>> {
        Ok(self.inner.lock().caches.get(connection_id).cloned())
    }

    async fn upsert_schema_cache(&self, record: &SchemaCacheRecord) -> Result<()> {
        self.inner
            .lock()
            .caches
            .insert(record.connection_id.clone(), record.clone());
        Ok(())
    }

    async fn set_training_status(&self, connection_id: &str, status: TrainingStatus) -> Result<()> {
        if let Some(record) = self.inner.lock().caches.get_mut(connection_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn list_stale_connections(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<StaleConnection>> {
        let inner = self.inner.lock();
        let mut stale: Vec<StaleConnection> = inner
            .connections
            .values()
            .filter_map(|conn| {
                let last = inner.caches.get(&conn.id).map(|c| c.last_trained_at);
                match last {
                    Some(at) if at >= threshold => None,
                    _ => Some(StaleConnection {
                        connection_id: conn.id.clone(),
                        user_id: conn.user_id.clone(),
                        last_trained_at: last,
                    }),
                }
            })
            .collect();
        stale.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        Ok(stale)
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn get_connection(&self, id: &str) -> Result<Option<StoredConnection>> {
        Ok(self.inner.lock().connections.get(id).cloned())
    }

    async fn save_connection(&self, connection: &StoredConnection) -> Result<()> {
        self.inner
            .lock()
            .connections
            .insert(connection.id.clone(), connection.clone());
        Ok(())
    }
}
