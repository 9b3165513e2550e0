//! PostgreSQL connector backed by an sqlx pool

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode, PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Either, Encode, Executor as _, Postgres, Row as _, Statement as _, Type, TypeInfo};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::config::{Engine, NetworkConfig};
use super::{
    hex_bytes, returns_rows, ColumnInfo, ConnectionConfig, ConnectionHandle, Connector,
    FieldInfo, ForeignKeyInfo, IndexInfo, KeyRole, PoolSlot, QueryResult, Row, SchemaIntrospection,
    ServerInfo,
};
use crate::error::{AppError, Result};

const DEFAULT_SCHEMA: &str = "public";

pub struct PostgresConnector {
    handle: ConnectionHandle,
    settings: NetworkConfig,
    engine: Engine,
    pool: PoolSlot<sqlx::Postgres>,
}

impl PostgresConnector {
    pub fn new(id: impl Into<String>, settings: NetworkConfig) -> Self {
        let handle = ConnectionHandle::new(id, ConnectionConfig::Postgres(settings.clone()));
        Self::with_handle(handle, settings, Engine::Postgres)
    }

    /// Reuse the Postgres wire protocol under another engine's identity and pool sizing
    pub(crate) fn with_handle(
        handle: ConnectionHandle,
        settings: NetworkConfig,
        engine: Engine,
    ) -> Self {
        Self {
            handle,
            settings,
            engine,
            pool: PoolSlot::new(),
        }
    }

    async fn open(&self) -> Result<PgPool> {
        let defaults = self.engine.pool_defaults();
        let mut options = PgConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .database(&self.settings.database)
            .ssl_mode(if self.settings.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(password) = &self.settings.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
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
}

#[async_trait]
impl Connector for PostgresConnector {
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
                    engine = %self.engine,
                    host = %self.settings.host,
                    "Connection pool established"
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
        info!(connection_id = %self.handle.id(), "Connection pool closed");
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
            let types = parameter_types(&pool, statement, params.len()).await?;
            let mut query = sqlx::query(statement);
            for (position, (value, ty)) in params.iter().zip(&types).enumerate() {
                query = bind_param(query, to_pg_param(position + 1, value, ty)?);
            }
            if returns_rows(statement) {
                let rows = query.fetch_all(&pool).await.map_err(query_error)?;
                Ok(rows_to_result(&rows))
            } else {
                let done = query.execute(&pool).await.map_err(query_error)?;
                Ok(QueryResult {
                    affected_rows: Some(done.rows_affected()),
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
            SELECT table_name::text AS table_name
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .bind(schema.unwrap_or(DEFAULT_SCHEMA))
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        Ok(rows.iter().map(|row| row.get("table_name")).collect())
    }

    async fn get_table_schema(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                c.column_name::text AS column_name,
                c.data_type::text AS data_type,
                c.udt_name::text AS udt_name,
                c.character_maximum_length::int4 AS char_length,
                c.numeric_precision::int4 AS numeric_precision,
                c.numeric_scale::int4 AS numeric_scale,
                (c.is_nullable = 'YES') AS nullable,
                c.column_default::text AS column_default,
                (c.is_identity = 'YES') AS is_identity,
                (
                    SELECT tc.constraint_type::text
                    FROM information_schema.key_column_usage k
                    JOIN information_schema.table_constraints tc
                      ON tc.constraint_name = k.constraint_name
                     AND tc.table_schema = k.table_schema
                     AND tc.table_name = k.table_name
                    WHERE k.table_schema = c.table_schema
                      AND k.table_name = c.table_name
                      AND k.column_name = c.column_name
                    ORDER BY CASE tc.constraint_type
                        WHEN 'PRIMARY KEY' THEN 0
                        WHEN 'UNIQUE' THEN 1
                        ELSE 2
                    END
                    LIMIT 1
                ) AS key_type
            FROM information_schema.columns c
            WHERE c.table_schema = $1 AND c.table_name = $2
            ORDER BY c.ordinal_position
            "#,
        )
        .bind(schema.unwrap_or(DEFAULT_SCHEMA))
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                let data_type: String = row.try_get("data_type").map_err(query_error)?;
                let udt_name: String = row.try_get("udt_name").map_err(query_error)?;
                let default: Option<String> = row.try_get("column_default").map_err(query_error)?;
                let is_identity: Option<bool> = row.try_get("is_identity").map_err(query_error)?;
                let key_type: Option<String> = row.try_get("key_type").map_err(query_error)?;

                let extra = if is_identity.unwrap_or(false) {
                    Some("identity".to_string())
                } else if default.as_deref().is_some_and(|d| d.starts_with("nextval(")) {
                    Some("auto_increment".to_string())
                } else {
                    None
                };

                Ok(ColumnInfo {
                    name: row.try_get("column_name").map_err(query_error)?,
                    data_type: compose_type(
                        &data_type,
                        &udt_name,
                        row.try_get("char_length").map_err(query_error)?,
                        row.try_get("numeric_precision").map_err(query_error)?,
                        row.try_get("numeric_scale").map_err(query_error)?,
                    ),
                    nullable: row
                        .try_get::<Option<bool>, _>("nullable")
                        .map_err(query_error)?
                        .unwrap_or(true),
                    default,
                    key_role: key_type.as_deref().and_then(key_role),
                    extra,
                })
            })
            .collect()
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl SchemaIntrospection for PostgresConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            "SELECT datname::text AS name FROM pg_database WHERE NOT datistemplate ORDER BY datname",
        )
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT schema_name::text AS name
            FROM information_schema.schemata
            WHERE schema_name NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND schema_name NOT LIKE 'pg_temp_%'
              AND schema_name NOT LIKE 'pg_toast_temp_%'
            ORDER BY schema_name
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;
        Ok(rows.iter().map(|row| row.get("name")).collect())
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
        let version: String = sqlx::query_scalar("SELECT version()")
            .fetch_one(&pool)
            .await
            .map_err(query_error)?;
        Ok(ServerInfo {
            engine: self.engine,
            version,
        })
    }

    async fn list_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                i.relname::text AS index_name,
                ix.indisunique AS is_unique,
                array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns
            FROM pg_class t
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_index ix ON ix.indrelid = t.oid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = $1 AND t.relname = $2
            GROUP BY i.relname, ix.indisunique
            ORDER BY i.relname
            "#,
        )
        .bind(schema.unwrap_or(DEFAULT_SCHEMA))
        .bind(table)
        .fetch_all(&pool)
        .await
        .map_err(query_error)?;

        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get("index_name"),
                columns: row.get("columns"),
                unique: row.get("is_unique"),
            })
            .collect())
    }

    async fn list_foreign_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<ForeignKeyInfo>> {
        let pool = self.pool.get()?;
        let rows = sqlx::query(
            r#"
            SELECT
                kcu.column_name::text AS column_name,
                ccu.table_name::text AS referenced_table,
                ccu.column_name::text AS referenced_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.constraint_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1
              AND tc.table_name = $2
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(schema.unwrap_or(DEFAULT_SCHEMA))
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

/// Fold length/precision/scale into the type name, e.g. `numeric(10,2)`
pub(crate) fn compose_type(
    data_type: &str,
    udt_name: &str,
    char_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    let base = match data_type {
        "ARRAY" | "USER-DEFINED" => udt_name,
        other => other,
    };
    if let Some(length) = char_length {
        return format!("{}({})", base, length);
    }
    if matches!(base, "numeric" | "decimal") {
        return match (precision, scale) {
            (Some(p), Some(s)) if s > 0 => format!("{}({},{})", base, p, s),
            (Some(p), _) => format!("{}({})", base, p),
            _ => base.to_string(),
        };
    }
    base.to_string()
}

fn key_role(constraint_type: &str) -> Option<KeyRole> {
    match constraint_type {
        "PRIMARY KEY" => Some(KeyRole::Primary),
        "UNIQUE" => Some(KeyRole::Unique),
        "FOREIGN KEY" => Some(KeyRole::Foreign),
        _ => None,
    }
}

pub(crate) fn rows_to_result(rows: &[PgRow]) -> QueryResult {
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

fn row_to_json(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), column_value(row, col.ordinal(), col.type_info().name())))
        .collect()
}

fn column_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(idx).ok().flatten()
    }

    match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::from),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(Value::from),
        "FLOAT8" => get::<f64>(row, idx).map(Value::from),
        "NUMERIC" => get::<rust_decimal::Decimal>(row, idx).map(|d| Value::from(d.to_string())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        "UUID" => get::<uuid::Uuid>(row, idx).map(|u| Value::from(u.to_string())),
        "TIMESTAMPTZ" => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339()))
        }
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx).map(|t| Value::from(t.to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, idx).map(|d| Value::from(d.to_string())),
        "TIME" => get::<chrono::NaiveTime>(row, idx).map(|t| Value::from(t.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, idx).map(|bytes| Value::from(hex_bytes(&bytes))),
        _ => get::<String>(row, idx).map(Value::from),
    }
    .unwrap_or(Value::Null)
}

// Parameters are bound as the type the server infers for each placeholder.
// Statements are cached by text, so the encoding must match that type exactly.

/// Types the server inferred for the placeholders of `statement`
async fn parameter_types(pool: &PgPool, statement: &str, supplied: usize) -> Result<Vec<PgTypeInfo>> {
    if supplied == 0 {
        return Ok(Vec::new());
    }
    let prepared = pool.prepare(statement).await.map_err(query_error)?;
    let types = match prepared.parameters() {
        Some(Either::Left(types)) => types.to_vec(),
        _ => Vec::new(),
    };
    if types.len() != supplied {
        return Err(AppError::Validation(format!(
            "Statement takes {} parameters, {} supplied",
            types.len(),
            supplied
        )));
    }
    Ok(types)
}

/// Text sent under the declared type of its placeholder. Covers text-like
/// types without a dedicated mapping (varchar, enums, citext); anything whose
/// wire form is not its text fails server-side and needs `$n::text::<type>`.
#[derive(Debug, Clone, PartialEq)]
struct DeclaredText {
    ty: PgTypeInfo,
    text: Option<String>,
}

impl Type<Postgres> for DeclaredText {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }
}

impl Encode<'_, Postgres> for DeclaredText {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        match &self.text {
            Some(text) => <&str as Encode<Postgres>>::encode(text.as_str(), buf),
            None => Ok(IsNull::Yes),
        }
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.ty.clone())
    }
}

/// One JSON parameter in the shape of its placeholder type
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Numeric(Option<Decimal>),
    Uuid(Option<uuid::Uuid>),
    Timestamptz(Option<DateTime<Utc>>),
    Timestamp(Option<NaiveDateTime>),
    Date(Option<NaiveDate>),
    Json(Option<Value>),
    Text(DeclaredText),
}

/// JSON `null` becomes SQL NULL of the placeholder type. Strings are accepted
/// for numeric, boolean, uuid, and temporal placeholders.
fn to_pg_param(position: usize, value: &Value, ty: &PgTypeInfo) -> Result<PgParam> {
    fn typed<T>(value: &Value, parse: impl FnOnce(&Value) -> Option<T>) -> Option<Option<T>> {
        if value.is_null() {
            Some(None)
        } else {
            parse(value).map(Some)
        }
    }
    fn int(value: &Value) -> Option<i64> {
        value.as_i64().or_else(|| value.as_str()?.trim().parse().ok())
    }
    fn float(value: &Value) -> Option<f64> {
        value.as_f64().or_else(|| value.as_str()?.trim().parse().ok())
    }
    fn decimal(value: &Value) -> Option<Decimal> {
        let raw = match value {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.trim().to_string(),
            _ => return None,
        };
        Decimal::from_str(&raw).or_else(|_| Decimal::from_scientific(&raw)).ok()
    }
    fn naive_timestamp(s: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
    }

    let converted = match ty.name() {
        "BOOL" => typed(value, |v| v.as_bool().or_else(|| v.as_str()?.parse().ok())).map(PgParam::Bool),
        "INT2" => typed(value, |v| i16::try_from(int(v)?).ok()).map(PgParam::Int2),
        "INT4" => typed(value, |v| i32::try_from(int(v)?).ok()).map(PgParam::Int4),
        "INT8" => typed(value, int).map(PgParam::Int8),
        "FLOAT4" => typed(value, |v| float(v).map(|f| f as f32)).map(PgParam::Float4),
        "FLOAT8" => typed(value, float).map(PgParam::Float8),
        "NUMERIC" => typed(value, decimal).map(PgParam::Numeric),
        "UUID" => typed(value, |v| v.as_str()?.parse().ok()).map(PgParam::Uuid),
        "TIMESTAMPTZ" => typed(value, |v| {
            DateTime::parse_from_rfc3339(v.as_str()?)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
        .map(PgParam::Timestamptz),
        "TIMESTAMP" => typed(value, |v| naive_timestamp(v.as_str()?)).map(PgParam::Timestamp),
        "DATE" => typed(value, |v| NaiveDate::parse_from_str(v.as_str()?, "%Y-%m-%d").ok())
            .map(PgParam::Date),
        "JSON" | "JSONB" => typed(value, |v| Some(v.clone())).map(PgParam::Json),
        _ => Some(PgParam::Text(DeclaredText {
            ty: ty.clone(),
            text: match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
        })),
    };

    converted.ok_or_else(|| {
        AppError::Validation(format!(
            "Parameter ${} is not a valid {}: {}",
            position,
            ty.name(),
            value
        ))
    })
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: PgParam,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        PgParam::Bool(v) => query.bind(v),
        PgParam::Int2(v) => query.bind(v),
        PgParam::Int4(v) => query.bind(v),
        PgParam::Int8(v) => query.bind(v),
        PgParam::Float4(v) => query.bind(v),
        PgParam::Float8(v) => query.bind(v),
        PgParam::Numeric(v) => query.bind(v),
        PgParam::Uuid(v) => query.bind(v),
        PgParam::Timestamptz(v) => query.bind(v),
        PgParam::Timestamp(v) => query.bind(v),
        PgParam::Date(v) => query.bind(v),
        PgParam::Json(v) => query.bind(v.map(Json)),
        PgParam::Text(v) => query.bind(v),
    }
}
