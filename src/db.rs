//! Postgres-backed job, schema cache, and connection store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    Job, JobFilter, JobPage, JobProgress, JobState, JobStats, SchemaCacheRecord, StaleConnection,
    StoredConnection, TrainingStatus,
};
use crate::store::{ConnectionStore, JobInsert, JobStore, SchemaCacheStore};

/// Tables and indexes created at start-up.
///
/// The partial unique index enforces the dedup key across every worker
/// process sharing this database.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    name        TEXT NOT NULL,
    config      JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS schema_cache (
    connection_id    TEXT PRIMARY KEY REFERENCES connections(id) ON DELETE CASCADE,
    summary          JSONB NOT NULL,
    schema_count     BIGINT NOT NULL DEFAULT 0,
    table_count      BIGINT NOT NULL DEFAULT 0,
    column_count     BIGINT NOT NULL DEFAULT 0,
    last_trained_at  TIMESTAMPTZ NOT NULL,
    status           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id                UUID PRIMARY KEY,
    job_type          TEXT NOT NULL,
    payload           JSONB NOT NULL,
    state             TEXT NOT NULL,
    priority          INTEGER NOT NULL DEFAULT 0,
    retry_limit       INTEGER NOT NULL,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    retry_delay_secs  BIGINT NOT NULL,
    retry_backoff     BOOLEAN NOT NULL,
    start_after       TIMESTAMPTZ NOT NULL,
    expire_at         TIMESTAMPTZ,
    singleton_key     TEXT,
    created_at        TIMESTAMPTZ NOT NULL,
    started_at        TIMESTAMPTZ,
    completed_at      TIMESTAMPTZ,
    progress          JSONB,
    output            JSONB,
    error             TEXT,
    retry_of          UUID
);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_singleton_idx
    ON jobs (job_type, singleton_key)
    WHERE singleton_key IS NOT NULL AND state IN ('created', 'retry', 'active');

CREATE INDEX IF NOT EXISTS jobs_fetch_idx
    ON jobs (job_type, state, priority DESC, created_at);

CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at DESC);
"#;

const JOB_COLUMNS: &str = "id, job_type, payload, state, priority, retry_limit, retry_count, \
     retry_delay_secs, retry_backoff, start_after, expire_at, singleton_key, created_at, \
     started_at, completed_at, progress, output, error, retry_of";

/// Database connection pool and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool and bootstrap the schema
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .connect(connection_string)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect: {}", e)))?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_singleton(&self, job_type: &str, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE job_type = $1 AND singleton_key = $2 AND state IN ('created', 'retry', 'active') \
             LIMIT 1"
        ))
        .bind(job_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for Database {
    async fn insert_job(&self, job: Job) -> Result<JobInsert> {
        // A conflicting holder can finish between the insert and the lookup
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, payload, state, priority, retry_limit, retry_count,
                    retry_delay_secs, retry_backoff, start_after, expire_at, singleton_key,
                    created_at, started_at, completed_at, progress, output, error, retry_of
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(Json(&job.payload))
            .bind(job.state.as_str())
            .bind(job.priority)
            .bind(job.retry_limit as i32)
            .bind(job.retry_count as i32)
            .bind(job.retry_delay_secs as i64)
            .bind(job.retry_backoff)
            .bind(job.start_after)
            .bind(job.expire_at)
            .bind(&job.singleton_key)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.progress.as_ref().map(Json))
            .bind(job.output.as_ref().map(Json))
            .bind(&job.error)
            .bind(job.retry_of)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() > 0 {
                return Ok(JobInsert::Created(job));
            }

            let Some(key) = &job.singleton_key else {
                return Err(AppError::Database(format!("Job {} already exists", job.id)));
            };
            if let Some(existing) = self.find_singleton(&job.job_type, key).await? {
                return Ok(JobInsert::Existing(existing));
            }
        }
        Err(AppError::Database(format!(
            "Could not insert job of type {}",
            job.job_type
        )))
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM jobs WHERE TRUE");
        push_filters(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get(0)?;

        let mut select =
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
        push_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(filter.per_page as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);
        let rows = select.build().fetch_all(&self.pool).await?;

        Ok(JobPage {
            jobs: rows.iter().map(job_from_row).collect::<Result<_>>()?,
            total: total as u64,
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
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs SET state = 'active', started_at = $3
            WHERE id IN (
                SELECT id FROM jobs
                WHERE job_type = $1
                  AND state IN ('created', 'retry')
                  AND start_after <= $3
                  AND (expire_at IS NULL OR expire_at > $3)
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_type)
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }

    async fn update_job_if(&self, job: &Job, expected: &[JobState]) -> Result<bool> {
        let expected: Vec<&str> = expected.iter().map(JobState::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = $2, retry_count = $3, start_after = $4, expire_at = $5,
                started_at = $6, completed_at = $7, output = $8, error = $9
            WHERE id = $1 AND state = ANY($10)
            "#,
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(job.retry_count as i32)
        .bind(job.start_after)
        .bind(job.expire_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.output.as_ref().map(Json))
        .bind(&job.error)
        .bind(&expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, id: Uuid, progress: &JobProgress) -> Result<bool> {
        let result =
            sqlx::query("UPDATE jobs SET progress = $2 WHERE id = $1 AND state = 'active'")
                .bind(id)
                .bind(Json(progress))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expire_jobs(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'expired', completed_at = $1
            WHERE state IN ('created', 'retry') AND expire_at IS NOT NULL AND expire_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn overdue_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'active'
              AND expire_at IS NOT NULL AND started_at IS NOT NULL
              AND started_at + (expire_at - start_after) <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn job_stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            match state.parse::<JobState>() {
                Ok(state) => stats.add(state, count as u64),
                Err(_) => warn!(state = %state, "Skipping unknown job state"),
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SchemaCacheStore for Database {
    async fn get_schema_cache(&self, connection_id: &str) -> Result<Option<SchemaCacheRecord>> {
        let row = sqlx::query(
            r#"
            SELECT connection_id, summary, schema_count, table_count, column_count,
                   last_trained_at, status
            FROM schema_cache
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<SchemaCacheRecord> {
            let Json(summary): Json<serde_json::Value> = row.try_get("summary")?;
            let status: String = row.try_get("status")?;
            Ok(SchemaCacheRecord {
                connection_id: row.try_get("connection_id")?,
                summary,
                schema_count: row.try_get("schema_count")?,
                table_count: row.try_get("table_count")?,
                column_count: row.try_get("column_count")?,
                last_trained_at: row.try_get("last_trained_at")?,
                status: TrainingStatus::parse(&status),
            })
        })
        .transpose()
    }

    async fn upsert_schema_cache(&self, record: &SchemaCacheRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schema_cache (
                connection_id, summary, schema_count, table_count, column_count,
                last_trained_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (connection_id) DO UPDATE SET
                summary = EXCLUDED.summary,
                schema_count = EXCLUDED.schema_count,
                table_count = EXCLUDED.table_count,
                column_count = EXCLUDED.column_count,
                last_trained_at = EXCLUDED.last_trained_at,
                status = EXCLUDED.status
            "#,
        )
        .bind(&record.connection_id)
        .bind(Json(&record.summary))
        .bind(record.schema_count)
        .bind(record.table_count)
        .bind(record.column_count)
        .bind(record.last_trained_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_training_status(&self, connection_id: &str, status: TrainingStatus) -> Result<()> {
        sqlx::query("UPDATE schema_cache SET status = $2 WHERE connection_id = $1")
            .bind(connection_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_stale_connections(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<StaleConnection>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.user_id, s.last_trained_at
            FROM connections c
            LEFT JOIN schema_cache s ON s.connection_id = c.id
            WHERE s.last_trained_at IS NULL OR s.last_trained_at < $1
            ORDER BY c.id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<StaleConnection> {
                Ok(StaleConnection {
                    connection_id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    last_trained_at: row.try_get("last_trained_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionStore for Database {
    async fn get_connection(&self, id: &str) -> Result<Option<StoredConnection>> {
        let row = sqlx::query("SELECT id, user_id, name, config FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<StoredConnection> {
            let Json(config): Json<serde_json::Value> = row.try_get("config")?;
            Ok(StoredConnection {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                config,
            })
        })
        .transpose()
    }

    async fn save_connection(&self, connection: &StoredConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, user_id, name, config)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                name = EXCLUDED.name,
                config = EXCLUDED.config,
                updated_at = NOW()
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.user_id)
        .bind(&connection.name)
        .bind(Json(&connection.config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Append the WHERE clauses of a job filter
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if let Some(state) = filter.state {
        builder.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(job_type) = &filter.job_type {
        builder.push(" AND job_type = ").push_bind(job_type.clone());
    }
    if let Some(user_id) = &filter.user_id {
        builder
            .push(" AND payload->>'user_id' = ")
            .push_bind(user_id.clone());
    }
    if let Some(after) = filter.created_after {
        builder.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        builder.push(" AND created_at < ").push_bind(before);
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let state: String = row.try_get("state")?;
    let progress: Option<Json<JobProgress>> = row.try_get("progress")?;
    let output: Option<Json<serde_json::Value>> = row.try_get("output")?;
    let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload,
        state: state.parse()?,
        priority: row.try_get("priority")?,
        retry_limit: row.try_get::<i32, _>("retry_limit")?.max(0) as u32,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        retry_delay_secs: row.try_get::<i64, _>("retry_delay_secs")?.max(0) as u64,
        retry_backoff: row.try_get("retry_backoff")?,
        start_after: row.try_get("start_after")?,
        expire_at: row.try_get("expire_at")?,
        singleton_key: row.try_get("singleton_key")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        progress: progress.map(|Json(p)| p),
        output: output.map(|Json(o)| o),
        error: row.try_get("error")?,
        retry_of: row.try_get("retry_of")?,
    })
}
