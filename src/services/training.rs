//! Schema training pipeline
//!
//! Walks a connection's schemas and tables and builds the cached schema
//! summary. The pipeline knows nothing about jobs or notifications: it
//! reports milestones through a [`ProgressSink`], and a sink error aborts
//! the run at the next stage boundary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connectors::registry::ConnectorRegistry;
use crate::connectors::{ColumnInfo, Connector, ForeignKeyInfo, IndexInfo, KeyRole, Row};
use crate::error::Result;
use crate::models::{
    MetadataOptions, SchemaCacheRecord, SchemaRebuildPayload, SchemaSelection, TrainingStatus,
};
use crate::store::SchemaCacheStore;

/// A cache younger than this is served without touching the connector
pub const CACHE_TTL_DAYS: i64 = 7;

/// Pipeline milestones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    Resolving,
    Schemas,
    Tables,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub stage: TrainingStage,
    pub current: u64,
    pub total: u64,
    pub message: String,
}

/// Receives pipeline milestones. Returning an error stops the run.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: TrainingProgress) -> Result<()>;
}

/// Sink that discards progress
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: TrainingProgress) -> Result<()> {
        Ok(())
    }
}

/// Constraint derived from key roles and foreign keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintInfo {
    /// `primary_key`, `unique`, or `foreign_key`
    pub kind: String,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSummary {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Vec<IndexInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_keys: Option<Vec<ForeignKeyInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<ConstraintInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rows: Option<Vec<Row>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEntry {
    pub name: String,
    pub tables: Vec<TableSummary>,
}

/// Aggregate schema document stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSummary {
    pub success: bool,
    pub connection_id: String,
    pub schemas: Vec<SchemaEntry>,
    pub total_schemas: u64,
    pub total_tables: u64,
    pub total_columns: u64,
    pub trained_at: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

impl SchemaSummary {
    /// Table names per schema
    pub fn table_names(&self) -> Vec<(String, Vec<String>)> {
        self.schemas
            .iter()
            .map(|s| (s.name.clone(), s.tables.iter().map(|t| t.name.clone()).collect()))
            .collect()
    }

    fn to_record(&self) -> Result<SchemaCacheRecord> {
        Ok(SchemaCacheRecord {
            connection_id: self.connection_id.clone(),
            summary: serde_json::to_value(self)?,
            schema_count: self.total_schemas as i64,
            table_count: self.total_tables as i64,
            column_count: self.total_columns as i64,
            last_trained_at: self.trained_at,
            status: TrainingStatus::Completed,
        })
    }
}

pub struct TrainingPipeline {
    registry: Arc<ConnectorRegistry>,
    caches: Arc<dyn SchemaCacheStore>,
    ttl: Duration,
}

impl TrainingPipeline {
    pub fn new(registry: Arc<ConnectorRegistry>, caches: Arc<dyn SchemaCacheStore>) -> Self {
        Self {
            registry,
            caches,
            ttl: Duration::days(CACHE_TTL_DAYS),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// The cached summary, when present, not forced, and younger than the TTL
    pub async fn fresh_cache(&self, connection_id: &str, force: bool) -> Result<Option<SchemaSummary>> {
        if force {
            return Ok(None);
        }
        let Some(record) = self.caches.get_schema_cache(connection_id).await? else {
            return Ok(None);
        };
        if Utc::now() - record.last_trained_at >= self.ttl {
            return Ok(None);
        }
        match serde_json::from_value::<SchemaSummary>(record.summary) {
            Ok(mut summary) => {
                summary.from_cache = true;
                Ok(Some(summary))
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Unreadable schema cache, retraining");
                Ok(None)
            }
        }
    }

    /// Compute the summary, serving a fresh cache when allowed
    pub async fn train(
        &self,
        request: &SchemaRebuildPayload,
        sink: &dyn ProgressSink,
    ) -> Result<SchemaSummary> {
        if let Some(cached) = self.fresh_cache(&request.connection_id, request.force).await? {
            debug!(connection_id = %request.connection_id, "Serving schema from cache");
            return Ok(cached);
        }

        sink.report(TrainingProgress {
            stage: TrainingStage::Resolving,
            current: 0,
            total: 1,
            message: "Resolving connector".into(),
        })
        .await?;
        let connector = self.registry.get_or_connect(&request.connection_id).await?;
        self.collect(connector.as_ref(), request, sink).await
    }

    /// Persist a computed summary. Cached summaries are not rewritten.
    pub async fn save(&self, summary: &SchemaSummary) -> Result<()> {
        if summary.from_cache {
            return Ok(());
        }
        self.caches.upsert_schema_cache(&summary.to_record()?).await?;
        info!(
            connection_id = %summary.connection_id,
            tables = summary.total_tables,
            columns = summary.total_columns,
            "Schema cache updated"
        );
        Ok(())
    }

    /// Best-effort status update on an existing cache record
    pub async fn set_status(&self, connection_id: &str, status: TrainingStatus) {
        if let Err(e) = self.caches.set_training_status(connection_id, status).await {
            warn!(connection_id = %connection_id, status = status.as_str(), error = %e, "Failed to record training status");
        }
    }

    /// Train and persist, recording the training status either way
    pub async fn retrain(
        &self,
        request: &SchemaRebuildPayload,
        sink: &dyn ProgressSink,
    ) -> Result<SchemaSummary> {
        let id = &request.connection_id;
        self.set_status(id, TrainingStatus::Training).await;

        let result: Result<SchemaSummary> = async {
            let summary = self.train(request, sink).await?;
            self.save(&summary).await?;
            Ok(summary)
        }
        .await;

        match &result {
            Ok(summary) if summary.from_cache => self.set_status(id, TrainingStatus::Completed).await,
            Ok(_) => {}
            Err(_) => self.set_status(id, TrainingStatus::Failed).await,
        }
        result
    }

    /// Walk the selected schemas and tables of a connected connector
    pub async fn collect(
        &self,
        connector: &dyn Connector,
        request: &SchemaRebuildPayload,
        sink: &dyn ProgressSink,
    ) -> Result<SchemaSummary> {
        let selection = self.resolve_selection(connector, request).await?;
        let total = selection.len() as u64;
        sink.report(TrainingProgress {
            stage: TrainingStage::Schemas,
            current: 0,
            total,
            message: format!("Found {} schema(s)", total),
        })
        .await?;

        let mut schemas = Vec::new();
        let mut total_tables = 0u64;
        let mut total_columns = 0u64;

        for (index, SchemaSelection { schema, tables }) in selection.into_iter().enumerate() {
            let tables = if tables.is_empty() {
                connector.list_tables(Some(&schema)).await?
            } else {
                tables
            };

            let mut entries = Vec::with_capacity(tables.len());
            for table in tables {
                let (entry, columns) = self.describe(connector, &schema, table, request).await?;
                total_columns += columns;
                entries.push(entry);
            }

            sink.report(TrainingProgress {
                stage: TrainingStage::Tables,
                current: index as u64 + 1,
                total,
                message: format!("Processed schema {} ({} tables)", schema, entries.len()),
            })
            .await?;

            if !entries.is_empty() {
                total_tables += entries.len() as u64;
                schemas.push(SchemaEntry {
                    name: schema,
                    tables: entries,
                });
            }
        }

        let summary = SchemaSummary {
            success: true,
            connection_id: request.connection_id.clone(),
            total_schemas: schemas.len() as u64,
            schemas,
            total_tables,
            total_columns,
            trained_at: Utc::now(),
            from_cache: false,
        };

        sink.report(TrainingProgress {
            stage: TrainingStage::Finished,
            current: total,
            total,
            message: format!(
                "Trained {} tables, {} columns",
                summary.total_tables, summary.total_columns
            ),
        })
        .await?;
        Ok(summary)
    }

    async fn resolve_selection(
        &self,
        connector: &dyn Connector,
        request: &SchemaRebuildPayload,
    ) -> Result<Vec<SchemaSelection>> {
        if let Some(selection) = &request.selection {
            return Ok(selection.clone());
        }
        let schemas = match connector.introspection() {
            Some(ext) if request.metadata.schema_metadata => ext.list_schemas().await?,
            _ => vec![connector.default_schema()],
        };
        Ok(schemas
            .into_iter()
            .map(|schema| SchemaSelection {
                schema,
                tables: Vec::new(),
            })
            .collect())
    }

    /// Gather the configured metadata for one table; returns the entry and its column count.
    /// `table_metadata` gates the table-level categories (indexes, keys, constraints,
    /// row counts, samples); `column_metadata` alone decides whether columns are listed.
    async fn describe(
        &self,
        connector: &dyn Connector,
        schema: &str,
        table: String,
        request: &SchemaRebuildPayload,
    ) -> Result<(TableSummary, u64)> {
        let opts = &request.metadata;
        let mut entry = TableSummary {
            name: table,
            columns: None,
            indexes: None,
            foreign_keys: None,
            constraints: None,
            row_count: None,
            sample_rows: None,
        };
        if !opts.table_metadata && !opts.column_metadata {
            return Ok((entry, 0));
        }

        let columns = connector.get_table_schema(&entry.name, Some(schema)).await?;
        let column_count = columns.len() as u64;
        if opts.table_metadata {
            self.describe_table(connector, schema, &mut entry, &columns, opts).await;
        }
        if opts.column_metadata {
            entry.columns = Some(columns);
        }
        Ok((entry, column_count))
    }

    /// Table-level categories; failures are logged and leave the category unset
    async fn describe_table(
        &self,
        connector: &dyn Connector,
        schema: &str,
        entry: &mut TableSummary,
        columns: &[ColumnInfo],
        opts: &MetadataOptions,
    ) {
        let ext = connector.introspection();
        let connection_id = connector.id();

        if opts.indexes {
            if let Some(ext) = ext {
                match ext.list_indexes(&entry.name, Some(schema)).await {
                    Ok(indexes) => entry.indexes = Some(indexes),
                    Err(e) => warn!(connection_id = %connection_id, table = %entry.name, error = %e, "Failed to list indexes"),
                }
            }
        }

        let mut foreign_keys = None;
        if opts.foreign_keys || opts.constraints {
            if let Some(ext) = ext {
                match ext.list_foreign_keys(&entry.name, Some(schema)).await {
                    Ok(fks) => foreign_keys = Some(fks),
                    Err(e) => warn!(connection_id = %connection_id, table = %entry.name, error = %e, "Failed to list foreign keys"),
                }
            }
        }

        if opts.constraints {
            entry.constraints = Some(derive_constraints(columns, foreign_keys.as_deref().unwrap_or_default()));
        }
        if opts.foreign_keys {
            entry.foreign_keys = foreign_keys;
        }

        let target = connector.quote_table(&entry.name, Some(schema));
        if opts.row_counts {
            let statement = format!("SELECT COUNT(*) AS row_count FROM {}", target);
            match connector.query(&statement, &[]).await {
                Ok(result) => entry.row_count = result.rows.first().and_then(first_integer),
                Err(e) => warn!(connection_id = %connection_id, table = %entry.name, error = %e, "Failed to count rows"),
            }
        }
        if opts.sample_data && opts.sample_row_count > 0 {
            let statement = format!("SELECT * FROM {} LIMIT {}", target, opts.sample_row_count);
            match connector.query(&statement, &[]).await {
                Ok(result) => entry.sample_rows = Some(result.rows),
                Err(e) => warn!(connection_id = %connection_id, table = %entry.name, error = %e, "Failed to sample rows"),
            }
        }
    }
}

/// Primary key, unique, and foreign key constraints of one table
pub fn derive_constraints(columns: &[ColumnInfo], foreign_keys: &[ForeignKeyInfo]) -> Vec<ConstraintInfo> {
    let mut constraints = Vec::new();

    let primary: Vec<String> = columns
        .iter()
        .filter(|c| c.key_role == Some(KeyRole::Primary))
        .map(|c| c.name.clone())
        .collect();
    if !primary.is_empty() {
        constraints.push(ConstraintInfo {
            kind: "primary_key".into(),
            columns: primary,
            references: None,
        });
    }

    for column in columns.iter().filter(|c| c.key_role == Some(KeyRole::Unique)) {
        constraints.push(ConstraintInfo {
            kind: "unique".into(),
            columns: vec![column.name.clone()],
            references: None,
        });
    }

    for fk in foreign_keys {
        constraints.push(ConstraintInfo {
            kind: "foreign_key".into(),
            columns: vec![fk.column.clone()],
            references: Some(format!("{}.{}", fk.referenced_table, fk.referenced_column)),
        });
    }
    constraints
}

fn first_integer(row: &Row) -> Option<i64> {
    match row.values().next()? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetadataOptions, StoredConnection};
    use crate::store::{ConnectionStore, MemoryStore};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder(Mutex<Vec<TrainingProgress>>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, progress: TrainingProgress) -> Result<()> {
            self.0.lock().push(progress);
            Ok(())
        }
    }

    async fn pipeline_for(path: &std::path::Path) -> (TrainingPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_connection(&StoredConnection {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "local".into(),
                config: json!({"type": "sqlite", "path": path}),
            })
            .await
            .unwrap();
        let registry = Arc::new(ConnectorRegistry::new(store.clone()));
        (TrainingPipeline::new(registry, store.clone()), store)
    }

    fn request(force: bool) -> SchemaRebuildPayload {
        SchemaRebuildPayload {
            connection_id: "c1".into(),
            user_id: "u1".into(),
            force,
            selection: None,
            metadata: MetadataOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_empty_database_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline_for(&dir.path().join("empty.db")).await;

        let summary = pipeline.train(&request(true), &NoProgress).await.unwrap();
        let doc = serde_json::to_value(&summary).unwrap();
        assert_eq!(doc["success"], json!(true));
        assert_eq!(doc["totalTables"], json!(0));
        assert_eq!(doc["totalColumns"], json!(0));
        assert_eq!(doc["schemas"], json!([]));
    }

    #[tokio::test]
    async fn test_collects_tables_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline_for(&dir.path().join("app.db")).await;
        let connector = pipeline.registry().get_or_connect("c1").await.unwrap();
        connector
            .query("CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT UNIQUE)", &[])
            .await
            .unwrap();
        connector
            .query(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, team_id INTEGER REFERENCES teams(id), email TEXT NOT NULL)",
                &[],
            )
            .await
            .unwrap();
        connector
            .query("INSERT INTO teams (name) VALUES ('core'), ('infra')", &[])
            .await
            .unwrap();

        let recorder = Recorder(Mutex::new(Vec::new()));
        let summary = pipeline.train(&request(true), &recorder).await.unwrap();

        assert_eq!(summary.total_schemas, 1);
        assert_eq!(summary.total_tables, 2);
        assert_eq!(summary.total_columns, 5);
        assert_eq!(
            summary.table_names(),
            vec![("main".to_string(), vec!["teams".to_string(), "users".to_string()])]
        );

        let teams = &summary.schemas[0].tables[0];
        assert_eq!(teams.row_count, Some(2));
        assert!(teams.sample_rows.is_none());
        let users = &summary.schemas[0].tables[1];
        let constraints = users.constraints.as_ref().unwrap();
        assert!(constraints
            .iter()
            .any(|c| c.kind == "foreign_key" && c.references.as_deref() == Some("teams.id")));

        let stages: Vec<_> = recorder.0.lock().iter().map(|p| p.stage).collect();
        assert_eq!(stages.first(), Some(&TrainingStage::Resolving));
        assert_eq!(stages.last(), Some(&TrainingStage::Finished));
    }

    #[tokio::test]
    async fn test_column_metadata_without_table_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline_for(&dir.path().join("cols.db")).await;
        let connector = pipeline.registry().get_or_connect("c1").await.unwrap();
        connector
            .query("CREATE TABLE teams (id INTEGER PRIMARY KEY, name TEXT UNIQUE)", &[])
            .await
            .unwrap();

        let mut columns_only = request(true);
        columns_only.metadata = MetadataOptions {
            table_metadata: false,
            ..MetadataOptions::default()
        };
        let summary = pipeline.train(&columns_only, &NoProgress).await.unwrap();
        let teams = &summary.schemas[0].tables[0];
        assert_eq!(summary.total_columns, 2);
        assert_eq!(teams.columns.as_ref().map(Vec::len), Some(2));
        assert!(teams.indexes.is_none());
        assert!(teams.constraints.is_none());
        assert!(teams.row_count.is_none());

        let mut names_only = request(true);
        names_only.metadata = MetadataOptions {
            table_metadata: false,
            column_metadata: false,
            ..MetadataOptions::default()
        };
        let summary = pipeline.train(&names_only, &NoProgress).await.unwrap();
        assert_eq!(summary.total_tables, 1);
        assert_eq!(summary.total_columns, 0);
        assert!(summary.schemas[0].tables[0].columns.is_none());
    }

    #[tokio::test]
    async fn test_selection_limits_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = pipeline_for(&dir.path().join("sel.db")).await;
        let connector = pipeline.registry().get_or_connect("c1").await.unwrap();
        for ddl in ["CREATE TABLE a (x INTEGER)", "CREATE TABLE b (y INTEGER, z TEXT)"] {
            connector.query(ddl, &[]).await.unwrap();
        }

        let mut req = request(true);
        req.selection = Some(vec![SchemaSelection {
            schema: "main".into(),
            tables: vec!["b".into()],
        }]);
        req.metadata.sample_data = true;

        let summary = pipeline.train(&req, &NoProgress).await.unwrap();
        assert_eq!(summary.total_tables, 1);
        assert_eq!(summary.total_columns, 2);
        assert_eq!(summary.schemas[0].tables[0].sample_rows, Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_connector() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline_for(&dir.path().join("cache.db")).await;

        let summary = pipeline.retrain(&request(true), &NoProgress).await.unwrap();
        assert!(!summary.from_cache);
        let record = store.get_schema_cache("c1").await.unwrap().unwrap();
        assert_eq!(record.status, TrainingStatus::Completed);

        // Break the stored config: a cache hit must not need the connector
        pipeline.registry().evict("c1").await.unwrap();
        store
            .save_connection(&StoredConnection {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "local".into(),
                config: json!({"type": "unsupported"}),
            })
            .await
            .unwrap();

        let cached = pipeline.train(&request(false), &NoProgress).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.trained_at, summary.trained_at);

        assert!(pipeline.train(&request(true), &NoProgress).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, store) = pipeline_for(&dir.path().join("stale.db")).await;
        let mut summary = pipeline.train(&request(true), &NoProgress).await.unwrap();
        summary.trained_at = Utc::now() - Duration::days(CACHE_TTL_DAYS + 1);
        store.upsert_schema_cache(&summary.to_record().unwrap()).await.unwrap();

        assert!(pipeline.fresh_cache("c1", false).await.unwrap().is_none());
    }

    #[test]
    fn test_derive_constraints() {
        let column = |name: &str, role| ColumnInfo {
            name: name.into(),
            data_type: "INTEGER".into(),
            nullable: false,
            default: None,
            key_role: role,
            extra: None,
        };
        let constraints = derive_constraints(
            &[
                column("id", Some(KeyRole::Primary)),
                column("code", Some(KeyRole::Unique)),
                column("other", None),
            ],
            &[],
        );
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].columns, vec!["id"]);
        assert_eq!(constraints[1].kind, "unique");
    }
}
