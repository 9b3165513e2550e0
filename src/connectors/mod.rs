//! Uniform connector contract over heterogeneous database engines
//!
//! Every engine implements [`Connector`]. Engines that can answer deeper
//! introspection questions also expose [`SchemaIntrospection`] through
//! [`Connector::introspection`]; callers probe for it instead of relying on
//! default method bodies.
//!
//! Lifecycle calls (`connect` / `disconnect`) on one connector must be
//! serialized by the caller. [`registry::ConnectorRegistry`] does this per
//! connection id.

pub mod config;
pub mod factory;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod sqlite;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{AppError, Result};

pub use config::{ConnectionConfig, Engine};

/// A single result row keyed by column name
pub type Row = Map<String, Value>;

/// Engine-independent query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub fields: Option<Vec<FieldInfo>>,
    pub affected_rows: Option<u64>,
    pub insert_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub type_name: String,
}

/// Role a column plays in the table's keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    Primary,
    Unique,
    Foreign,
    Index,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub key_role: Option<KeyRole>,
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub engine: Engine,
    pub version: String,
}

/// Live state of one connection handle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub last_error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

/// Identity plus shared state bookkeeping for a connector
#[derive(Debug)]
pub struct ConnectionHandle {
    id: String,
    config: ConnectionConfig,
    state: RwLock<ConnectionState>,
}

impl ConnectionHandle {
    pub fn new(id: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            id: id.into(),
            config,
            state: RwLock::new(ConnectionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> Engine {
        self.config.engine()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub(crate) fn mark_connected(&self) {
        let mut state = self.state.write();
        state.is_connected = true;
        state.last_error = None;
        state.last_connected = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&self, error: &str) {
        let mut state = self.state.write();
        state.is_connected = false;
        state.last_error = Some(error.to_string());
    }

    pub(crate) fn mark_disconnected(&self) {
        self.state.write().is_connected = false;
    }
}

/// The one live native pool a connector owns at a time
pub(crate) struct PoolSlot<DB: sqlx::Database> {
    pool: RwLock<Option<sqlx::Pool<DB>>>,
}

impl<DB: sqlx::Database> PoolSlot<DB> {
    pub(crate) fn new() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }

    /// Clone of the live pool, or a connection error when disconnected
    pub(crate) fn get(&self) -> Result<sqlx::Pool<DB>> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| AppError::Connection("Not connected".into()))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.pool.read().is_some()
    }

    pub(crate) fn set(&self, pool: sqlx::Pool<DB>) {
        *self.pool.write() = Some(pool);
    }

    /// Detach and close the current pool, if any
    pub(crate) async fn close(&self) {
        let old = self.pool.write().take();
        if let Some(pool) = old {
            pool.close().await;
        }
    }
}

/// Required lifecycle and introspection operations of every engine
#[async_trait]
pub trait Connector: Send + Sync {
    fn handle(&self) -> &ConnectionHandle;

    /// Schema used when the caller does not name one
    fn default_schema(&self) -> String;

    /// Tear down any existing pool, open a new one, and probe it
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Round-trip probe. Never errors; failures are recorded on the handle.
    async fn test_connection(&self) -> bool;

    async fn query(&self, statement: &str, params: &[Value]) -> Result<QueryResult>;

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>>;

    /// Columns in ordinal order
    async fn get_table_schema(&self, table: &str, schema: Option<&str>)
        -> Result<Vec<ColumnInfo>>;

    /// Qualified, quoted table reference for generated statements
    fn quote_table(&self, table: &str, schema: Option<&str>) -> String {
        let table = quote_with(table, '"');
        match schema {
            Some(schema) => format!("{}.{}", quote_with(schema, '"'), table),
            None => table,
        }
    }

    /// Optional introspection capability
    fn introspection(&self) -> Option<&dyn SchemaIntrospection> {
        None
    }

    fn id(&self) -> &str {
        self.handle().id()
    }

    fn engine(&self) -> Engine {
        self.handle().engine()
    }

    fn state(&self) -> ConnectionState {
        self.handle().state()
    }
}

/// Optional capabilities. Probe with [`Connector::introspection`].
#[async_trait]
pub trait SchemaIntrospection: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// User schemas, excluding engine-internal ones
    async fn list_schemas(&self) -> Result<Vec<String>>;

    /// Round-trip latency of a trivial statement
    async fn ping(&self) -> Result<Duration>;

    async fn server_info(&self) -> Result<ServerInfo>;

    async fn list_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>>;

    async fn list_foreign_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<ForeignKeyInfo>>;
}

/// Double the quote character inside an identifier and wrap it
pub(crate) fn quote_with(ident: &str, quote: char) -> String {
    let escaped = ident.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

/// Postgres-style `\x` hex rendering of binary values
pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Whether a statement produces a row set rather than an affected-row count
pub fn returns_rows(statement: &str) -> bool {
    let mut rest = statement.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE" | "DESC" | "VALUES" | "TABLE"
    ) {
        return true;
    }

    rest.to_ascii_uppercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word == "RETURNING")
}

/// Bind JSON positional parameters onto an sqlx query. MySQL and SQLite
/// coerce these on their own; Postgres binds by inferred placeholder type
/// (see `postgres::to_pg_param`).
macro_rules! bind_json_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                ::serde_json::Value::Null => query.bind(None::<String>),
                ::serde_json::Value::Bool(b) => query.bind(*b),
                ::serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                ::serde_json::Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }
        query
    }};
}

pub(crate) use bind_json_params;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows_classification() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("  select * from t"));
        assert!(returns_rows("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(returns_rows("-- leading comment\nSELECT 1"));
        assert!(returns_rows("/* hint */ SHOW TABLES"));
        assert!(returns_rows("(SELECT 1) UNION (SELECT 2)"));
        assert!(returns_rows("PRAGMA table_info('users')"));
        assert!(returns_rows("INSERT INTO t (a) VALUES (1) RETURNING id"));

        assert!(!returns_rows("INSERT INTO t (a) VALUES (1)"));
        assert!(!returns_rows("UPDATE t SET returning_flag = 1"));
        assert!(!returns_rows("CREATE TABLE t (id INTEGER)"));
        assert!(!returns_rows(""));
    }

    #[test]
    fn test_quote_with_escapes() {
        assert_eq!(quote_with("users", '"'), "\"users\"");
        assert_eq!(quote_with("we\"ird", '"'), "\"we\"\"ird\"");
        assert_eq!(quote_with("a`b", '`'), "`a``b`");
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(hex_bytes(&[0xde, 0xad, 0x01]), "\\xdead01");
        assert_eq!(hex_bytes(&[]), "\\x");
    }

    #[test]
    fn test_handle_state_transitions() {
        let handle = ConnectionHandle::new(
            "c1",
            ConnectionConfig::Sqlite(config::SqliteConfig { path: None }),
        );
        assert!(!handle.state().is_connected);

        handle.mark_failed("boom");
        let state = handle.state();
        assert!(!state.is_connected);
        assert_eq!(state.last_error.as_deref(), Some("boom"));

        handle.mark_connected();
        let state = handle.state();
        assert!(state.is_connected);
        assert!(state.last_error.is_none());
        assert!(state.last_connected.is_some());

        handle.mark_disconnected();
        assert!(!handle.state().is_connected);
    }
}
