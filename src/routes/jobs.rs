//! Job, training, and sweep endpoints

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Job, JobFilter, JobOptions, JobPage, JobStats, MetadataOptions, SchemaRebuildPayload,
    SchemaSelection, SCHEMA_REBUILD_JOB,
};
use crate::routes::acting_user;
use crate::services::notifications::PushEvent;
use crate::state::AppState;
use crate::store::JobInsert;
use crate::tasks::scheduler::SweepSummary;

/// Request body for job creation
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(alias = "type")]
    pub job_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub options: JobOptions,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Request body for a training run; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrainRequest {
    pub force: bool,
    pub selection: Option<Vec<SchemaSelection>>,
    pub metadata: MetadataOptions,
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    /// False when an existing job with the same dedup key was returned
    pub created: bool,
    pub job: Job,
}

impl From<JobInsert> for EnqueueResponse {
    fn from(inserted: JobInsert) -> Self {
        let created = inserted.is_created();
        let job = inserted.into_job();
        Self {
            job_id: job.id,
            created,
            job,
        }
    }
}

/// Load a job the acting user may see
async fn owned_job(state: &AppState, id: Uuid, user_id: &str) -> Result<Job> {
    let job = state.queue.get(id).await?;
    match job.payload.get("user_id").and_then(Value::as_str) {
        Some(owner) if owner != user_id => Err(AppError::NotFound(format!("Job not found: {}", id))),
        _ => Ok(job),
    }
}

/// POST /api/v1/jobs
///
/// Enqueues a job owned by the acting user. Returns 201 for a new job and
/// 200 when a live job with the same dedup key already exists.
pub async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let user_id = acting_user(&headers)?;
    let mut payload = request.payload;
    let Some(fields) = payload.as_object_mut() else {
        return Err(AppError::Validation("Job payload must be a JSON object".into()));
    };
    fields.insert("user_id".into(), Value::String(user_id));

    let inserted = state
        .queue
        .create(&request.job_type, payload, request.options)
        .await?;
    let status = if inserted.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(inserted.into())))
}

/// GET /api/v1/jobs
///
/// Lists the acting user's jobs. Query: state, job_type, created_after,
/// created_before, page, per_page.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<JobFilter>,
) -> Result<Json<JobPage>> {
    filter.user_id = Some(acting_user(&headers)?);
    Ok(Json(state.queue.list(filter).await?))
}

/// GET /api/v1/jobs/stats
pub async fn job_stats(State(state): State<AppState>) -> Result<Json<JobStats>> {
    Ok(Json(state.queue.stats().await?))
}

/// GET /api/v1/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    let user_id = acting_user(&headers)?;
    Ok(Json(owned_job(&state, id, &user_id).await?))
}

/// POST /api/v1/jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>> {
    let user_id = acting_user(&headers)?;
    owned_job(&state, id, &user_id).await?;
    Ok(Json(state.queue.cancel(id).await?))
}

/// POST /api/v1/jobs/:id/retry
///
/// Re-enqueues a failed, cancelled, or expired job as a new job
pub async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let user_id = acting_user(&headers)?;
    owned_job(&state, id, &user_id).await?;
    let inserted = state.queue.retry(id).await?;
    let status = if inserted.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(inserted.into())))
}

/// POST /api/v1/connections/:id/train
///
/// Enqueues a schema rebuild for one of the acting user's connections.
/// Returns 202 Accepted; progress arrives over the notification stream.
pub async fn train_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<String>,
    request: Option<Json<TrainRequest>>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let user_id = acting_user(&headers)?;
    let connection = state
        .stores
        .connections
        .get_connection(&connection_id)
        .await?
        .filter(|c| c.user_id == user_id)
        .ok_or_else(|| AppError::NotFound(format!("Connection not found: {}", connection_id)))?;

    let Json(request) = request.unwrap_or_default();
    let payload = SchemaRebuildPayload {
        connection_id: connection.id,
        user_id,
        force: request.force,
        selection: request.selection,
        metadata: request.metadata,
    };
    let options = JobOptions {
        priority: request.priority,
        ..Default::default()
    };
    let inserted = state
        .queue
        .create(SCHEMA_REBUILD_JOB, serde_json::to_value(&payload)?, options)
        .await?;
    info!(
        connection_id = %payload.connection_id,
        job_id = %inserted.job().id,
        created = inserted.is_created(),
        "Schema training requested"
    );
    Ok((StatusCode::ACCEPTED, Json(inserted.into())))
}

/// POST /api/v1/scheduler/run
///
/// Runs a sweep now and returns its summary. The summary is also pushed to
/// the acting user's notification channels.
pub async fn run_scheduler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepSummary>> {
    let user_id = acting_user(&headers)?;
    let summary = state.scheduler.trigger().await?;
    state
        .hub
        .send_notification(&user_id, PushEvent::new("sweep_completed", json!(summary)));
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use crate::models::{JobState, StoredConnection};
    use crate::routes::{router, USER_HEADER};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(app: &Router, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn app_with_connection() -> (AppState, Router) {
        let state = AppState::in_memory();
        state
            .stores
            .connections
            .save_connection(&StoredConnection {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "local".into(),
                config: json!({"type": "sqlite", "path": ":memory:"}),
            })
            .await
            .unwrap();
        let app = router(state.clone());
        (state, app)
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let (_, app) = app_with_connection().await;
        let (status, body) = send(&app, "GET", "/api/v1/jobs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], json!(401));
    }

    #[tokio::test]
    async fn test_train_dedups_and_cancel() {
        let (_, app) = app_with_connection().await;

        let (status, first) = send(&app, "POST", "/api/v1/connections/c1/train", Some("u1"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["created"], json!(true));

        let (_, second) = send(
            &app,
            "POST",
            "/api/v1/connections/c1/train",
            Some("u1"),
            Some(json!({"force": true})),
        )
        .await;
        assert_eq!(second["created"], json!(false));
        assert_eq!(second["jobId"], first["jobId"]);

        let id = first["jobId"].as_str().unwrap().to_string();
        let (status, job) = send(&app, "POST", &format!("/api/v1/jobs/{}/cancel", id), Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["state"], json!("cancelled"));

        let (status, _) = send(&app, "POST", &format!("/api/v1/jobs/{}/cancel", id), Some("u1"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, retried) = send(&app, "POST", &format!("/api/v1/jobs/{}/retry", id), Some("u1"), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(retried["job"]["retry_of"], json!(id));
    }

    #[tokio::test]
    async fn test_foreign_connection_and_job_are_hidden() {
        let (state, app) = app_with_connection().await;
        let (status, _) = send(&app, "POST", "/api/v1/connections/c1/train", Some("u2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, created) = send(&app, "POST", "/api/v1/connections/c1/train", Some("u1"), None).await;
        let id = created["jobId"].as_str().unwrap();
        let (status, _) = send(&app, "GET", &format!("/api/v1/jobs/{}", id), Some("u2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, page) = send(&app, "GET", "/api/v1/jobs?state=created", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], json!(1));
        let (_, page) = send(&app, "GET", "/api/v1/jobs", Some("u2"), None).await;
        assert_eq!(page["total"], json!(0));
        assert_eq!(state.queue.stats().await.unwrap().created, 1);
    }

    #[tokio::test]
    async fn test_create_generic_job() {
        let (state, app) = app_with_connection().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some("u1"),
            Some(json!({"type": "report", "payload": {"week": 42}, "options": {"priority": 5}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["job"]["payload"]["user_id"], json!("u1"));
        assert_eq!(body["job"]["priority"], json!(5));

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some("u1"),
            Some(json!({"type": "report", "payload": [1, 2]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some("u1"),
            Some(json!({"type": "report", "payload": {}, "options": {"expire_in_secs": 100_000_000_000_000_000u64}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("expire_in_secs"));

        let (status, stats) = send(&app, "GET", "/api/v1/jobs/stats", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["created"], json!(1));
        assert_eq!(
            state.queue.get(body["jobId"].as_str().unwrap().parse().unwrap()).await.unwrap().state,
            JobState::Created
        );
    }

    #[tokio::test]
    async fn test_manual_sweep_enqueues_stale_connections() {
        let (state, app) = app_with_connection().await;
        let mut channel = state.hub.register("u1");
        channel.recv().await.unwrap();

        let (status, summary) = send(&app, "POST", "/api/v1/scheduler/run", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total"], json!(1));
        assert_eq!(summary["successful"], json!(1));
        assert_eq!(channel.recv().await.unwrap().event, "sweep_completed");
        assert_eq!(state.queue.stats().await.unwrap().created, 1);
    }
}
