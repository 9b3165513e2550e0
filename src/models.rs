//! Core domain models for SchemaKeeper

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Job type name of the schema rebuild handler
pub const SCHEMA_REBUILD_JOB: &str = "schema-rebuild";

/// Lifecycle state of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be picked up for the first time
    Created,
    /// Failed at least once and waiting for another attempt
    Retry,
    /// Claimed by a worker slot
    Active,
    /// Handler finished successfully
    Completed,
    /// Cancelled before finishing
    Cancelled,
    /// Never picked up before its expiry
    Expired,
    /// Retries exhausted
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Created,
        JobState::Retry,
        JobState::Active,
        JobState::Completed,
        JobState::Cancelled,
        JobState::Expired,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Retry => "retry",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Expired => "expired",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Expired | JobState::Failed
        )
    }

    /// States a worker may claim
    pub fn is_queued(&self) -> bool {
        matches!(self, JobState::Created | JobState::Retry)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("Unknown job state: {}", s)))
    }
}

/// Progress record of a running job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub percentage: u8,
    pub message: String,
}

impl JobProgress {
    pub fn new(current: u64, total: u64, message: impl Into<String>) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        Self {
            current,
            total,
            percentage,
            message: message.into(),
        }
    }
}

/// A unit of tracked, retryable background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub retry_delay_secs: u64,
    pub retry_backoff: bool,
    /// Earliest time a worker may claim the job
    pub start_after: DateTime<Utc>,
    /// Queued jobs still unclaimed after this moment expire. The same window,
    /// measured from `started_at`, bounds an active attempt.
    pub expire_at: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Option<JobProgress>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Original job when this one was spawned by a manual retry
    pub retry_of: Option<Uuid>,
}

impl Job {
    /// Moment an active attempt counts as abandoned
    pub fn active_deadline(&self) -> Option<DateTime<Utc>> {
        let window = self.expire_at? - self.start_after;
        self.started_at?.checked_add_signed(window)
    }
}

/// Per-call overrides for job creation. Unset fields fall back to queue defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub priority: Option<i32>,
    pub retry_limit: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub retry_backoff: Option<bool>,
    pub expire_in_secs: Option<u64>,
    pub singleton_key: Option<String>,
    pub start_after: Option<DateTime<Utc>>,
}

/// Schema/table selection for a selective training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSelection {
    pub schema: String,
    /// Empty means every table of the schema
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Which metadata categories a training run gathers per table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataOptions {
    pub schema_metadata: bool,
    pub table_metadata: bool,
    pub column_metadata: bool,
    pub indexes: bool,
    pub foreign_keys: bool,
    pub constraints: bool,
    pub row_counts: bool,
    pub sample_data: bool,
    pub sample_row_count: u32,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            schema_metadata: true,
            table_metadata: true,
            column_metadata: true,
            indexes: true,
            foreign_keys: true,
            constraints: true,
            row_counts: true,
            sample_data: false,
            sample_row_count: 5,
        }
    }
}

/// Payload of a schema rebuild job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRebuildPayload {
    pub connection_id: String,
    pub user_id: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub selection: Option<Vec<SchemaSelection>>,
    #[serde(default)]
    pub metadata: MetadataOptions,
}

/// Training status stored alongside the schema cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Training,
    Completed,
    Failed,
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStatus::Pending => "pending",
            TrainingStatus::Training => "training",
            TrainingStatus::Completed => "completed",
            TrainingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "training" => TrainingStatus::Training,
            "completed" => TrainingStatus::Completed,
            "failed" => TrainingStatus::Failed,
            _ => TrainingStatus::Pending,
        }
    }
}

/// Cached schema summary of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaCacheRecord {
    pub connection_id: String,
    pub summary: Value,
    pub schema_count: i64,
    pub table_count: i64,
    pub column_count: i64,
    pub last_trained_at: DateTime<Utc>,
    pub status: TrainingStatus,
}

/// A registered target database as persisted by the connection store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Raw config document, normalized by the connector factory
    pub config: Value,
}

/// A connection whose cache is missing or older than the staleness threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleConnection {
    pub connection_id: String,
    pub user_id: String,
    pub last_trained_at: Option<DateTime<Utc>>,
}

/// Kinds of user notifications about a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Started,
    Progress,
    Completed,
    Failed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Started => "started",
            NotificationKind::Progress => "progress",
            NotificationKind::Completed => "completed",
            NotificationKind::Failed => "failed",
        }
    }
}

/// Ephemeral job-status event delivered to live clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub job_id: Uuid,
    pub event_type: NotificationKind,
    pub user_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(job_id: Uuid, event_type: NotificationKind, user_id: &str, payload: Value) -> Self {
        Self {
            job_id,
            event_type,
            user_id: user_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Filters and pagination for job listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub user_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            job_type: None,
            user_id: None,
            created_after: None,
            created_before: None,
            page: 1,
            per_page: 20,
        }
    }
}

impl JobFilter {
    /// Clamp pagination to sane bounds
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.per_page = self.per_page.clamp(1, 100);
        self
    }

    pub fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.per_page as u64
    }

    /// Whether a job passes every filter (pagination aside)
    pub fn matches(&self, job: &Job) -> bool {
        if self.state.is_some_and(|s| s != job.state) {
            return false;
        }
        if self.job_type.as_deref().is_some_and(|t| t != job.job_type) {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if job.payload.get("user_id").and_then(Value::as_str) != Some(user_id.as_str()) {
                return false;
            }
        }
        if self.created_after.is_some_and(|t| job.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| job.created_at >= t) {
            return false;
        }
        true
    }
}

/// One page of jobs plus the unpaginated total
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Job counts by state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub created: u64,
    pub retry: u64,
    pub active: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub failed: u64,
    pub total: u64,
}

impl JobStats {
    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Created => &mut self.created,
            JobState::Retry => &mut self.retry,
            JobState::Active => &mut self.active,
            JobState::Completed => &mut self.completed,
            JobState::Cancelled => &mut self.cancelled,
            JobState::Expired => &mut self.expired,
            JobState::Failed => &mut self.failed,
        };
        *slot += count;
        self.total += count;
    }
}
