//! Schema rebuild job handler
//!
//! Five fixed stages: validate (10) -> connect (30) -> fetch metadata (60)
//! -> process and cache (80) -> complete (100). Each stage stores job
//! progress, notifies the requesting user, and publishes a push event.
//! Failures emit a `failed` notification and are returned unchanged so the
//! queue's retry policy applies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Job, JobProgress, NotificationEvent, NotificationKind, SchemaRebuildPayload, TrainingStatus,
};
use crate::services::notifications::{JobEventBus, NotificationHub, PushEvent};
use crate::services::training::{ProgressSink, SchemaSummary, TrainingPipeline, TrainingProgress};
use crate::services::worker::{JobContext, JobHandler};

/// Progress percentages of the five stages, in order
pub const STAGE_PERCENTAGES: [u8; 5] = [10, 30, 60, 80, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Validate,
    Connect,
    FetchMetadata,
    ProcessAndCache,
    Complete,
}

impl Stage {
    fn percentage(self) -> u8 {
        STAGE_PERCENTAGES[self as usize]
    }

    fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Connect => "connect",
            Stage::FetchMetadata => "fetch_metadata",
            Stage::ProcessAndCache => "process_and_cache",
            Stage::Complete => "complete",
        }
    }

    fn kind(self) -> NotificationKind {
        match self {
            Stage::Validate => NotificationKind::Started,
            Stage::Complete => NotificationKind::Completed,
            _ => NotificationKind::Progress,
        }
    }
}

pub struct SchemaRebuildHandler {
    pipeline: Arc<TrainingPipeline>,
    hub: Arc<NotificationHub>,
    events: JobEventBus,
}

impl SchemaRebuildHandler {
    pub fn new(pipeline: Arc<TrainingPipeline>, hub: Arc<NotificationHub>, events: JobEventBus) -> Self {
        Self {
            pipeline,
            hub,
            events,
        }
    }

    async fn run(&self, job: &Job, reporter: &Reporter<'_>) -> Result<Value> {
        let payload: SchemaRebuildPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("Invalid schema rebuild payload: {}", e)))?;
        reporter
            .stage(Stage::Validate, format!("Validated rebuild of {}", payload.connection_id))
            .await?;

        let cached = self
            .pipeline
            .fresh_cache(&payload.connection_id, payload.force)
            .await?;
        if cached.is_none() {
            self.pipeline
                .registry()
                .get_or_connect(&payload.connection_id)
                .await?;
        }
        let message = if cached.is_some() {
            "Using cached schema"
        } else {
            "Connected to database"
        };
        reporter.stage(Stage::Connect, message).await?;

        reporter.stage(Stage::FetchMetadata, "Fetching schema metadata").await?;
        self.pipeline
            .set_status(&payload.connection_id, TrainingStatus::Training)
            .await;
        let summary = self.pipeline.train(&payload, reporter).await?;

        reporter
            .stage(
                Stage::ProcessAndCache,
                format!(
                    "Caching {} tables, {} columns",
                    summary.total_tables, summary.total_columns
                ),
            )
            .await?;
        self.pipeline.save(&summary).await?;
        if summary.from_cache {
            self.pipeline
                .set_status(&payload.connection_id, TrainingStatus::Completed)
                .await;
        }

        let output = job_output(&summary);
        reporter
            .stage_with(Stage::Complete, "Schema rebuild complete", output.clone())
            .await?;
        Ok(output)
    }
}

#[async_trait]
impl JobHandler for SchemaRebuildHandler {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<Value> {
        let user_id = job
            .payload
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reporter = Reporter {
            ctx: &ctx,
            hub: &self.hub,
            events: &self.events,
            job_id: job.id,
            user_id: &user_id,
        };

        match self.run(&job, &reporter).await {
            Ok(output) => Ok(output),
            Err(AppError::JobCancelled(id)) => {
                info!(job_id = %id, "Schema rebuild cancelled");
                Err(AppError::JobCancelled(id))
            }
            Err(e) => {
                if let Some(connection_id) = job.payload.get("connection_id").and_then(Value::as_str) {
                    self.pipeline.set_status(connection_id, TrainingStatus::Failed).await;
                }
                reporter.failed(&job, &e);
                Err(e)
            }
        }
    }
}

/// Fans one stage out to job progress, the user's channels, and the job's push stream
struct Reporter<'a> {
    ctx: &'a JobContext,
    hub: &'a NotificationHub,
    events: &'a JobEventBus,
    job_id: Uuid,
    user_id: &'a str,
}

impl Reporter<'_> {
    async fn stage(&self, stage: Stage, message: impl Into<String>) -> Result<()> {
        self.stage_with(stage, message, Value::Null).await
    }

    async fn stage_with(&self, stage: Stage, message: impl Into<String>, result: Value) -> Result<()> {
        let message = message.into();
        let percentage = stage.percentage();
        // Fails with JobCancelled once the job left active; nothing is emitted then
        self.ctx
            .progress(JobProgress::new(percentage as u64, 100, message.clone()))
            .await?;

        let mut data = json!({
            "jobId": self.job_id,
            "stage": stage.name(),
            "percentage": percentage,
            "message": message,
        });
        if !result.is_null() {
            data["result"] = result;
        }

        let kind = stage.kind();
        let event = NotificationEvent::new(self.job_id, kind, self.user_id, data.clone());
        self.hub.notify(&event);
        self.events
            .publish(self.job_id, PushEvent::new(kind.as_str(), data).with_id(percentage.to_string()));
        debug!(job_id = %self.job_id, stage = stage.name(), percentage = percentage, "Schema rebuild stage");
        Ok(())
    }

    fn failed(&self, job: &Job, error: &AppError) {
        let data = json!({
            "jobId": self.job_id,
            "error": error.to_string(),
            "attempt": job.retry_count + 1,
            "retryLimit": job.retry_limit,
        });
        let event = NotificationEvent::new(self.job_id, NotificationKind::Failed, self.user_id, data.clone());
        self.hub.notify(&event);
        self.events.publish(
            self.job_id,
            PushEvent::new(NotificationKind::Failed.as_str(), data),
        );
        warn!(job_id = %self.job_id, error = %error, "Schema rebuild failed");
    }
}

/// Pipeline milestones become extra push events; the job's stored progress stays on the stage grid
#[async_trait]
impl<'a> ProgressSink for Reporter<'a> {
    async fn report(&self, progress: TrainingProgress) -> Result<()> {
        self.ctx.check_cancelled().await?;
        let data = serde_json::to_value(&progress)?;
        self.events
            .publish(self.job_id, PushEvent::new("training_progress", data));
        Ok(())
    }
}

fn job_output(summary: &SchemaSummary) -> Value {
    let schemas: Vec<Value> = summary
        .table_names()
        .into_iter()
        .map(|(name, tables)| json!({ "name": name, "tables": tables }))
        .collect();
    json!({
        "success": summary.success,
        "connectionId": summary.connection_id,
        "totalSchemas": summary.total_schemas,
        "totalTables": summary.total_tables,
        "totalColumns": summary.total_columns,
        "schemas": schemas,
        "fromCache": summary.from_cache,
        "trainedAt": summary.trained_at,
    })
}
