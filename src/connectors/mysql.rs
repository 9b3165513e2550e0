//! MySQL / MariaDB connector backed by an sqlx pool

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Column, Row as _, TypeInfo};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::config::{Engine, NetworkConfig};
use super::{
    bind_json_params, hex_bytes, quote_with, returns_rows, ColumnInfo, ConnectionConfig,
    ConnectionHandle, Connector, FieldInfo, ForeignKeyInfo, IndexInfo, KeyRole, PoolSlot,
    QueryResult, Row, SchemaIntrospection, ServerInfo,
};
use crate::error::{AppError, Result};

const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

pub struct MySqlConnector {
    handle: ConnectionHandle,
    settings: NetworkConfig,
    pool: PoolSlot<sqlx::MySql>,
}

impl MySqlConnector {
    pub fn new(id: impl Into<String>, settings: NetworkConfig) -> Self {
        Self {
            handle: ConnectionHandle::new(id, ConnectionConfig::MySql(settings.clone())),
            settings,
            pool: PoolSlot::new(),
        }
    }

    async fn open(&self) -> Result<MySqlPool> {
        let defaults = Engine::MySql.pool_defaults();
        let mut options = MySqlConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .database(&self.settings.database)
            .ssl_mode(if self.settings.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });
        if let Some(password) = &self.settings.password {
            options = options.password(password);
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(defaults.max_connections)
            .idle_timeout(Some(defaults.idle_timeout))
            .acquire_timeout(defaults.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect: {}", e)))?;

        if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
            pool.close().await;
            return Err(AppError::Connection(format!("Connection probe failed: {}", e)));
        }

        Ok(pool)
    }

    fn database<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(&self.settings.database)
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn default_schema(&self) -> String {
        self.settings.database.clone()
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
                    host = %self.settings.host,
                    database = %self.settings.database,
                    "MySQL connection pool established"
                );
                Ok(())
            }
            Err(e) => {
                self.handle.mark_failed(&e.to_string());
                error!(connection_id = %self.handle.id(), error = %e, "Failed to connect");
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        self.handle.mark_disconnected();
        info!(connection_id = %self.handle.id(), "MySQL connection pool closed");
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
                let insert_id = done.last_insert_id();
                Ok(QueryResult {
                    affected_rows: Some(done.rows_affected()),
                    insert_id: (insert_id > 0).then_some(insert_id as i64),
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
        let rows = sqlx::query(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR) AS table_name
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#,
        )
        .bind(self.database(schema))
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        Ok(rows.iter().map(|row| row.get("table_name")).collect())
    }

    /// Column types are returned exactly as MySQL reports them in `COLUMN_TYPE`
    async fn get_table_schema(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(COLUMN_TYPE AS CHAR) AS column_type,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(COLUMN_KEY AS CHAR) AS column_key,
                CAST(EXTRA AS CHAR) AS extra
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(self.database(schema))
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                let is_nullable: String = row.try_get("is_nullable").map_err(query_error)?;
                let column_key: Option<String> = row.try_get("column_key").map_err(query_error)?;
                let extra: Option<String> = row.try_get("extra").map_err(query_error)?;
                Ok(ColumnInfo {
                    name: row.try_get("column_name").map_err(query_error)?,
                    data_type: row.try_get("column_type").map_err(query_error)?,
                    nullable: is_nullable.eq_ignore_ascii_case("YES"),
                    default: row.try_get("column_default").map_err(query_error)?,
                    key_role: column_key.as_deref().and_then(key_role),
                    extra: extra.filter(|e| !e.is_empty()),
                })
            })
            .collect()
    }

    fn quote_table(&self, table: &str, schema: Option<&str>) -> String {
        let table = quote_with(table, '`');
        match schema {
            Some(schema) => format!("{}.{}", quote_with(schema, '`'), table),
            None => table,
        }
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl SchemaIntrospection for MySqlConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            "SELECT CAST(SCHEMA_NAME AS CHAR) AS name FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME",
        )
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .filter(|name| !SYSTEM_DATABASES.contains(&name.as_str()))
            .collect())
    }

    /// A MySQL schema is a database; training stays inside the configured one
    async fn list_schemas(&self) -> Result<Vec<String>> {
        Ok(vec![self.settings.database.clone()])
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
        let version: String = sqlx::query_scalar("SELECT CAST(VERSION() AS CHAR)")
            .fetch_one(&pool)
            .await
            .map_err(query_error)?;
        Ok(ServerInfo {
            engine: Engine::MySql,
            version,
        })
    }

    async fn list_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(INDEX_NAME AS CHAR) AS index_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique
            FROM information_schema.STATISTICS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(self.database(schema))
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &rows {
            let name: String = row.get("index_name");
            let column: String = row.get("column_name");
            let non_unique: i64 = row.get("non_unique");
            match indexes.last_mut() {
                Some(index) if index.name == name => index.columns.push(column),
                _ => indexes.push(IndexInfo {
                    name,
                    columns: vec![column],
                    unique: non_unique == 0,
                }),
            }
        }
        Ok(indexes)
    }

    async fn list_foreign_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<ForeignKeyInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(REFERENCED_TABLE_NAME AS CHAR) AS referenced_table,
                CAST(REFERENCED_COLUMN_NAME AS CHAR) AS referenced_column
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND REFERENCED_TABLE_NAME IS NOT NULL
            ORDER BY ORDINAL_POSITION
            "#,
        )
        .bind(self.database(schema))
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        Ok(rows
            .iter()
            .map(|row| ForeignKeyInfo {
                column: row.get("column_name"),
                referenced_table: row.get("referenced_table"),
                referenced_column: row.get("referenced_column"),
            })
            .collect())
    }
}

fn query_error(err: sqlx::Error) -> AppError {
    AppError::Query(err.to_string())
}

fn key_role(column_key: &str) -> Option<KeyRole> {
    match column_key {
        "PRI" => Some(KeyRole::Primary),
        "UNI" => Some(KeyRole::Unique),
        "MUL" => Some(KeyRole::Index),
        _ => None,
    }
}

fn rows_to_result(rows: &[MySqlRow]) -> QueryResult {
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

fn row_to_json(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), column_value(row, col.ordinal(), col.type_info().name())))
        .collect()
}

fn column_value(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r MySqlRow, idx: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>,
    {
        row.try_get::<Option<T>, _>(idx).ok().flatten()
    }

    let unsigned = type_name.ends_with("UNSIGNED");
    match type_name.split_whitespace().next().unwrap_or_default() {
        "BOOLEAN" => get::<bool>(row, idx).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" if unsigned => {
            get::<u64>(row, idx).map(Value::from)
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            get::<i64>(row, idx).map(Value::from)
        }
        "FLOAT" => get::<f32>(row, idx).map(Value::from),
        "DOUBLE" => get::<f64>(row, idx).map(Value::from),
        "DECIMAL" => get::<rust_decimal::Decimal>(row, idx).map(|d| Value::from(d.to_string())),
        "JSON" => get::<Value>(row, idx),
        "DATETIME" => get::<chrono::NaiveDateTime>(row, idx).map(|t| Value::from(t.to_string())),
        "TIMESTAMP" => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339()))
        }
        "DATE" => get::<chrono::NaiveDate>(row, idx).map(|d| Value::from(d.to_string())),
        "TIME" => get::<chrono::NaiveTime>(row, idx).map(|t| Value::from(t.to_string())),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            get::<Vec<u8>>(row, idx).map(|bytes| Value::from(hex_bytes(&bytes)))
        }
        _ => get::<String>(row, idx).map(Value::from),
    }
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NetworkConfig {
        NetworkConfig {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: None,
            database: "shop".into(),
            ssl: false,
        }
    }

    #[test]
    fn test_key_role_mapping() {
        assert_eq!(key_role("PRI"), Some(KeyRole::Primary));
        assert_eq!(key_role("UNI"), Some(KeyRole::Unique));
        assert_eq!(key_role("MUL"), Some(KeyRole::Index));
        assert_eq!(key_role(""), None);
    }

    #[test]
    fn test_backtick_quoting() {
        let connector = MySqlConnector::new("my", settings());
        assert_eq!(connector.quote_table("orders", Some("shop")), "`shop`.`orders`");
        assert_eq!(connector.quote_table("odd`name", None), "`odd``name`");
    }

    #[tokio::test]
    async fn test_default_schema_is_configured_database() {
        let connector = MySqlConnector::new("my", settings());
        assert_eq!(connector.default_schema(), "shop");
        let schemas = connector.introspection().unwrap().list_schemas().await.unwrap();
        assert_eq!(schemas, vec!["shop".to_string()]);
    }
}
