//! SQLite connector for file-backed and in-memory databases

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::config::{Engine, SqliteConfig};
use super::{
    bind_json_params, hex_bytes, quote_with, returns_rows, ColumnInfo, ConnectionConfig,
    ConnectionHandle, Connector, FieldInfo, ForeignKeyInfo, IndexInfo, KeyRole, PoolSlot,
    QueryResult, Row, SchemaIntrospection, ServerInfo,
};
use crate::error::{AppError, Result};

const DEFAULT_SCHEMA: &str = "main";

pub struct SqliteConnector {
    handle: ConnectionHandle,
    settings: SqliteConfig,
    pool: PoolSlot<sqlx::Sqlite>,
}

impl SqliteConnector {
    pub fn new(id: impl Into<String>, settings: SqliteConfig) -> Self {
        Self {
            handle: ConnectionHandle::new(id, ConnectionConfig::Sqlite(settings.clone())),
            settings,
            pool: PoolSlot::new(),
        }
    }

    async fn open(&self) -> Result<SqlitePool> {
        let defaults = Engine::Sqlite.pool_defaults();
        let pool = match &self.settings.path {
            Some(path) => {
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                SqlitePoolOptions::new()
                    .max_connections(defaults.max_connections)
                    .idle_timeout(Some(defaults.idle_timeout))
                    .acquire_timeout(defaults.connect_timeout)
                    .connect_with(options)
                    .await
            }
            None => {
                // Every connection to :memory: is its own database, so keep exactly one alive
                let options = SqliteConnectOptions::from_str("sqlite::memory:")
                    .map_err(|e| AppError::Connection(e.to_string()))?;
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .acquire_timeout(defaults.connect_timeout)
                    .connect_with(options)
                    .await
            }
        }
        .map_err(|e| AppError::Connection(format!("Failed to open database: {}", e)))?;

        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
            pool.close().await;
            return Err(AppError::Connection(format!("Connection probe failed: {}", e)));
        }

        Ok(pool)
    }

    fn location(&self) -> String {
        self.settings
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    async fn pragma_rows(&self, pragma: &str, schema: Option<&str>, arg: &str) -> Result<Vec<SqliteRow>> {
        let pool = self.pool.get()?;
        let statement = format!(
            "PRAGMA {}.{}({})",
            quote_with(schema.unwrap_or(DEFAULT_SCHEMA), '"'),
            pragma,
            quote_with(arg, '"')
        );
        sqlx::query(&statement)
            .fetch_all(&pool)
            .await
            .map_err(query_error)
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn default_schema(&self) -> String {
        DEFAULT_SCHEMA.to_string()
    }

    async fn connect(&self) -> Result<()> {
        self.pool.close().await;
        self.handle.mark_disconnected();

        match self.open().await {
            Ok(pool) => {
                self.pool.set(pool);
                self.handle.mark_connected();
                info!(
                    connection_id = %self.handle.id(),
                    location = %self.location(),
                    "SQLite database opened"
                );
                Ok(())
            }
            Err(e) => {
                self.handle.mark_failed(&e.to_string());
                error!(connection_id = %self.handle.id(), error = %e, "Failed to open database");
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        self.handle.mark_disconnected();
        info!(connection_id = %self.handle.id(), "SQLite database closed");
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        if !self.pool.is_open() && self.connect().await.is_err() {
            return false;
        }
        let pool = match self.pool.get() {
            Ok(pool) => pool,
            Err(e) => {
                self.handle.mark_failed(&e.to_string());
                return false;
            }
        };
        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => {
                self.handle.mark_connected();
                true
            }
            Err(e) => {
                self.handle.mark_failed(&e.to_string());
                warn!(connection_id = %self.handle.id(), error = %e, "Connection test failed");
                false
            }
        }
    }

    async fn query(&self, statement: &str, params: &[Value]) -> Result<QueryResult> {
        let result: Result<QueryResult> = async {
            let pool = self.pool.get()?;
            let query = bind_json_params!(sqlx::query(statement), params);
            if returns_rows(statement) {
                let rows = query.fetch_all(&pool).await.map_err(query_error)?;
                Ok(rows_to_result(&rows))
            } else {
                let done = query.execute(&pool).await.map_err(query_error)?;
                let insert_id = done.last_insert_rowid();
                Ok(QueryResult {
                    affected_rows: Some(done.rows_affected()),
                    insert_id: (insert_id > 0).then_some(insert_id),
                    ..Default::default()
                })
            }
        }
        .await;

        if let Err(e) = &result {
            error!(connection_id = %self.handle.id(), error = %e, "Query failed");
        }
        result
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let pool = self.pool.get()?;
        let statement = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote_with(schema.unwrap_or(DEFAULT_SCHEMA), '"')
        );
        let rows = sqlx::query(&statement)
            .fetch_all(&pool)
            .await
            .map_err(query_error)?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    /// Types come from `PRAGMA table_info`; key roles merge index and foreign key pragmas
    async fn get_table_schema(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let rows = self.pragma_rows("table_info", schema, table).await?;
        let indexes = self.list_indexes(table, schema).await?;
        let foreign_keys = self.list_foreign_keys(table, schema).await?;
        let pk_count = rows
            .iter()
            .filter(|row| row.try_get::<i64, _>("pk").unwrap_or(0) > 0)
            .count();

        let mut columns: Vec<(i64, ColumnInfo)> = rows
            .iter()
            .map(|row| -> Result<(i64, ColumnInfo)> {
                let cid: i64 = row.try_get("cid").map_err(query_error)?;
                let name: String = row.try_get("name").map_err(query_error)?;
                let declared: String = row.try_get("type").map_err(query_error)?;
                let not_null: i64 = row.try_get("notnull").map_err(query_error)?;
                let pk: i64 = row.try_get("pk").map_err(query_error)?;
                let default: Option<String> = row.try_get("dflt_value").unwrap_or(None);

                let data_type = if declared.trim().is_empty() {
                    "ANY".to_string()
                } else {
                    declared
                };
                let key_role = if pk > 0 {
                    Some(KeyRole::Primary)
                } else if foreign_keys.iter().any(|fk| fk.column == name) {
                    Some(KeyRole::Foreign)
                } else if indexes.iter().any(|ix| ix.unique && ix.columns == [name.clone()]) {
                    Some(KeyRole::Unique)
                } else if indexes.iter().any(|ix| ix.columns.contains(&name)) {
                    Some(KeyRole::Index)
                } else {
                    None
                };
                let extra = (pk > 0 && pk_count == 1 && data_type.eq_ignore_ascii_case("INTEGER"))
                    .then(|| "auto_increment".to_string());

                Ok((
                    cid,
                    ColumnInfo {
                        name,
                        data_type,
                        nullable: not_null == 0 && pk == 0,
                        default,
                        key_role,
                        extra,
                    },
                ))
            })
            .collect::<Result<_>>()?;

        columns.sort_by_key(|(cid, _)| *cid);
        Ok(columns.into_iter().map(|(_, column)| column).collect())
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl SchemaIntrospection for SqliteConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query("PRAGMA database_list")
            .fetch_all(&pool)
            .await
            .map_err(query_error)?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(self
            .list_databases()
            .await?
            .into_iter()
            .filter(|name| name != "temp")
            .collect())
    }

    async fn ping(&self) -> Result<Duration> {
        let pool = self.pool.get()?;
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| AppError::Connection(e.to_string()))?;
        Ok(started.elapsed())
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        let pool = self.pool.get()?;
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&pool)
            .await
            .map_err(query_error)?;
        Ok(ServerInfo {
            engine: Engine::Sqlite,
            version,
        })
    }

    async fn list_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        let mut indexes = Vec::new();
        for row in self.pragma_rows("index_list", schema, table).await? {
            let name: String = row.try_get("name").map_err(query_error)?;
            let unique: i64 = row.try_get("unique").map_err(query_error)?;
            let columns = self
                .pragma_rows("index_info", schema, &name)
                .await?
                .iter()
                .filter_map(|info| info.try_get::<Option<String>, _>("name").ok().flatten())
                .collect();
            indexes.push(IndexInfo {
                name,
                columns,
                unique: unique != 0,
            });
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    async fn list_foreign_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<ForeignKeyInfo>> {
        let rows = self.pragma_rows("foreign_key_list", schema, table).await?;
        rows.iter()
            .map(|row| -> Result<ForeignKeyInfo> {
                let referenced_column: Option<String> = row.try_get("to").unwrap_or(None);
                Ok(ForeignKeyInfo {
                    column: row.try_get("from").map_err(query_error)?,
                    referenced_table: row.try_get("table").map_err(query_error)?,
                    referenced_column: referenced_column.unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn query_error(err: sqlx::Error) -> AppError {
    AppError::Query(err.to_string())
}

fn rows_to_result(rows: &[SqliteRow]) -> QueryResult {
    let fields = rows.first().map(|row| {
        row.columns()
            .iter()
            .map(|col| FieldInfo {
                name: col.name().to_string(),
                type_name: col.type_info().name().to_string(),
            })
            .collect()
    });
    QueryResult {
        rows: rows.iter().map(row_to_json).collect(),
        fields,
        affected_rows: None,
        insert_id: None,
    }
}

fn row_to_json(row: &SqliteRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), column_value(row, col.ordinal())))
        .collect()
}

/// SQLite values are dynamically typed, so try storage classes in turn
fn column_value(row: &SqliteRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
        return Value::from(v);
    }
    if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Value::from(hex_bytes(&v));
    }
    Value::Null
}
