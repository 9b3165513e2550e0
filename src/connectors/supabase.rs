//! Supabase connector
//!
//! Authenticates against the platform REST API with the public key plus the
//! privileged service-role key. When a database password is configured, SQL
//! and introspection go over a direct Postgres pool instead; otherwise the
//! PostgREST OpenAPI document describes tables and the `exec_sql` RPC runs
//! statements.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::config::{Engine, SupabaseConfig};
use super::postgres::PostgresConnector;
use super::{
    ColumnInfo, ConnectionConfig, ConnectionHandle, Connector, ForeignKeyInfo, IndexInfo, KeyRole,
    QueryResult, SchemaIntrospection, ServerInfo,
};
use crate::error::{AppError, Result};

const DEFAULT_SCHEMA: &str = "public";

pub struct SupabaseConnector {
    handle: ConnectionHandle,
    settings: SupabaseConfig,
    http: reqwest::Client,
    direct: Option<PostgresConnector>,
    openapi: RwLock<Option<Arc<Value>>>,
}

impl SupabaseConnector {
    pub fn new(id: impl Into<String>, settings: SupabaseConfig) -> Result<Self> {
        let id = id.into();
        let direct = settings.direct_config()?.map(|direct| {
            let handle = ConnectionHandle::new(id.clone(), ConnectionConfig::Postgres(direct.clone()));
            PostgresConnector::with_handle(handle, direct, Engine::Supabase)
        });

        let defaults = Engine::Supabase.pool_defaults();
        let http = reqwest::Client::builder()
            .connect_timeout(defaults.connect_timeout)
            .timeout(Duration::from_secs(30))
            .default_headers(auth_headers(&settings)?)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            handle: ConnectionHandle::new(id, ConnectionConfig::Supabase(settings.clone())),
            settings,
            http,
            direct,
            openapi: RwLock::new(None),
        })
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.settings.project_url.trim_end_matches('/'), path)
    }

    /// Fetch the OpenAPI description, which doubles as the connection probe
    async fn fetch_openapi(&self) -> Result<Arc<Value>> {
        let response = self
            .http
            .get(self.rest_url(""))
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("Platform API unreachable: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Connection(format!(
                "Platform API rejected credentials: HTTP {}",
                status
            )));
        }
        let doc: Value = response
            .json()
            .await
            .map_err(|e| AppError::Connection(format!("Invalid OpenAPI document: {}", e)))?;
        let doc = Arc::new(doc);
        *self.openapi.write() = Some(Arc::clone(&doc));
        Ok(doc)
    }

    async fn openapi(&self) -> Result<Arc<Value>> {
        let cached = self.openapi.read().clone();
        match cached {
            Some(doc) => Ok(doc),
            None => self.fetch_openapi().await,
        }
    }

    async fn exec_sql(&self, statement: &str) -> Result<QueryResult> {
        let response = self
            .http
            .post(self.rest_url("rpc/exec_sql"))
            .json(&json!({ "query": statement }))
            .send()
            .await
            .map_err(|e| AppError::Query(e.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            return Err(AppError::Query(format!("HTTP {}: {}", status, message)));
        }

        let rows = match body {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            Value::Object(row) => vec![row],
            _ => Vec::new(),
        };
        Ok(QueryResult {
            rows,
            ..Default::default()
        })
    }
}

fn auth_headers(settings: &SupabaseConfig) -> Result<HeaderMap> {
    let invalid = |e: reqwest::header::InvalidHeaderValue| {
        AppError::Validation(format!("Invalid API key: {}", e))
    };
    let mut headers = HeaderMap::new();
    headers.insert("apikey", HeaderValue::from_str(&settings.anon_key).map_err(invalid)?);
    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", settings.service_role_key))
        .map_err(invalid)?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);
    Ok(headers)
}

#[async_trait]
impl Connector for SupabaseConnector {
    fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    fn default_schema(&self) -> String {
        DEFAULT_SCHEMA.to_string()
    }

    async fn connect(&self) -> Result<()> {
        *self.openapi.write() = None;
        self.handle.mark_disconnected();

        let result: Result<()> = async {
            self.fetch_openapi().await?;
            if let Some(direct) = &self.direct {
                direct.connect().await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.handle.mark_connected();
                info!(
                    connection_id = %self.handle.id(),
                    project = %self.settings.project_url,
                    direct = self.direct.is_some(),
                    "Supabase project connected"
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
        if let Some(direct) = &self.direct {
            direct.disconnect().await?;
        }
        *self.openapi.write() = None;
        self.handle.mark_disconnected();
        info!(connection_id = %self.handle.id(), "Supabase project disconnected");
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let probe: Result<()> = async {
            self.fetch_openapi().await?;
            if let Some(direct) = &self.direct {
                if !direct.test_connection().await {
                    let reason = direct
                        .state()
                        .last_error
                        .unwrap_or_else(|| "direct database probe failed".to_string());
                    return Err(AppError::Connection(reason));
                }
            }
            Ok(())
        }
        .await;
        match probe {
            Ok(()) => {
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
        if let Some(direct) = &self.direct {
            return direct.query(statement, params).await;
        }
        let result = if params.is_empty() {
            self.exec_sql(statement).await
        } else {
            Err(AppError::Query(
                "Positional parameters require a database password".into(),
            ))
        };
        if let Err(e) = &result {
            error!(connection_id = %self.handle.id(), error = %e, "Query failed");
        }
        result
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        if let Some(direct) = &self.direct {
            return direct.list_tables(schema).await;
        }
        Ok(openapi_tables(&*self.fetch_openapi().await?))
    }

    async fn get_table_schema(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        if let Some(direct) = &self.direct {
            return direct.get_table_schema(table, schema).await;
        }
        openapi_columns(&*self.openapi().await?, table)
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl SchemaIntrospection for SupabaseConnector {
    async fn list_databases(&self) -> Result<Vec<String>> {
        match self.direct.as_ref().and_then(|d| d.introspection()) {
            Some(ext) => ext.list_databases().await,
            None => Ok(vec!["postgres".to_string()]),
        }
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        match self.direct.as_ref().and_then(|d| d.introspection()) {
            Some(ext) => ext.list_schemas().await,
            None => Ok(vec![DEFAULT_SCHEMA.to_string()]),
        }
    }

    async fn ping(&self) -> Result<Duration> {
        if let Some(ext) = self.direct.as_ref().and_then(|d| d.introspection()) {
            return ext.ping().await;
        }
        let started = Instant::now();
        self.fetch_openapi().await?;
        Ok(started.elapsed())
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        if let Some(ext) = self.direct.as_ref().and_then(|d| d.introspection()) {
            return ext.server_info().await;
        }
        let doc = self.openapi().await?;
        let version = doc
            .pointer("/info/version")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Ok(ServerInfo {
            engine: Engine::Supabase,
            version: format!("PostgREST {}", version),
        })
    }

    async fn list_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        match self.direct.as_ref().and_then(|d| d.introspection()) {
            Some(ext) => ext.list_indexes(table, schema).await,
            None => Ok(Vec::new()),
        }
    }

    async fn list_foreign_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<ForeignKeyInfo>> {
        match self.direct.as_ref().and_then(|d| d.introspection()) {
            Some(ext) => ext.list_foreign_keys(table, schema).await,
            None => openapi_foreign_keys(&*self.openapi().await?, table),
        }
    }
}

fn openapi_tables(doc: &Value) -> Vec<String> {
    let mut tables: Vec<String> = doc
        .get("definitions")
        .and_then(Value::as_object)
        .map(|defs| defs.keys().cloned().collect())
        .unwrap_or_default();
    tables.sort();
    tables
}

fn openapi_definition<'a>(doc: &'a Value, table: &str) -> Result<&'a Value> {
    doc.pointer(&format!("/definitions/{}", table.replace('~', "~0").replace('/', "~1")))
        .ok_or_else(|| AppError::NotFound(format!("Table not found: {}", table)))
}

/// Columns in document order, which PostgREST emits by ordinal position
fn openapi_columns(doc: &Value, table: &str) -> Result<Vec<ColumnInfo>> {
    let definition = openapi_definition(doc, table)?;
    let required: Vec<&str> = definition
        .get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let Some(properties) = definition.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    Ok(properties
        .iter()
        .map(|(name, prop)| {
            let base = prop
                .get("format")
                .or_else(|| prop.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let data_type = match prop.get("maxLength").and_then(Value::as_u64) {
                Some(len) => format!("{}({})", base, len),
                None => base.to_string(),
            };
            let description = prop.get("description").and_then(Value::as_str).unwrap_or("");
            let key_role = if description.contains("<pk/>") {
                Some(KeyRole::Primary)
            } else if description.contains("<fk ") {
                Some(KeyRole::Foreign)
            } else {
                None
            };
            let default = prop.get("default").map(|d| match d {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            ColumnInfo {
                name: name.clone(),
                data_type,
                nullable: !required.contains(&name.as_str()),
                default,
                key_role,
                extra: None,
            }
        })
        .collect())
}

fn openapi_foreign_keys(doc: &Value, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let definition = openapi_definition(doc, table)?;
    let Some(properties) = definition.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    Ok(properties
        .iter()
        .filter_map(|(name, prop)| {
            let description = prop.get("description")?.as_str()?;
            let (referenced_table, referenced_column) = parse_fk_marker(description)?;
            Some(ForeignKeyInfo {
                column: name.clone(),
                referenced_table,
                referenced_column,
            })
        })
        .collect())
}

/// Parse PostgREST's `<fk table='users' column='id'/>` description marker
fn parse_fk_marker(description: &str) -> Option<(String, String)> {
    let marker = &description[description.find("<fk ")?..];
    let attr = |key: &str| -> Option<String> {
        let start = marker.find(&format!("{}='", key))? + key.len() + 2;
        let len = marker[start..].find('\'')?;
        Some(marker[start..start + len].to_string())
    };
    Some((attr("table")?, attr("column")?))
}
