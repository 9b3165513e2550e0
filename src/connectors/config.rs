//! Engine-tagged connection configuration and alias normalization

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[serde(rename = "postgresql")]
    Postgres,
    MySql,
    Sqlite,
    Supabase,
}

impl Engine {
    /// Resolve an engine discriminator, accepting common aliases
    pub fn parse(discriminator: &str) -> Result<Self> {
        match discriminator.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "sqlite" | "sqlite3" => Ok(Engine::Sqlite),
            "supabase" => Ok(Engine::Supabase),
            other => Err(AppError::Validation(format!(
                "Unsupported database type: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgresql",
            Engine::MySql => "mysql",
            Engine::Sqlite => "sqlite",
            Engine::Supabase => "supabase",
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Engine::Postgres | Engine::Supabase => Some(5432),
            Engine::MySql => Some(3306),
            Engine::Sqlite => None,
        }
    }

    /// Pool sizing used when connecting to this engine
    pub fn pool_defaults(&self) -> PoolDefaults {
        match self {
            Engine::Postgres => PoolDefaults {
                max_connections: 20,
                idle_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(2),
            },
            Engine::MySql => PoolDefaults {
                max_connections: 10,
                idle_timeout: Duration::from_secs(60),
                connect_timeout: Duration::from_secs(10),
            },
            Engine::Sqlite => PoolDefaults {
                max_connections: 5,
                idle_timeout: Duration::from_secs(600),
                connect_timeout: Duration::from_secs(5),
            },
            Engine::Supabase => PoolDefaults {
                max_connections: 10,
                idle_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(5),
            },
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDefaults {
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

/// Settings for the pooled network engines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: String,
    pub ssl: bool,
}

/// Settings for the embedded file engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// `None` opens a private in-memory database
    pub path: Option<PathBuf>,
}

/// Settings for the hosted platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupabaseConfig {
    pub project_url: String,
    /// Public key, sent as `apikey`
    #[serde(skip_serializing)]
    pub anon_key: String,
    /// Privileged key, used for introspection and the SQL RPC
    #[serde(skip_serializing)]
    pub service_role_key: String,
    /// Enables a direct Postgres pool when present
    #[serde(skip_serializing)]
    pub db_password: Option<String>,
}

impl SupabaseConfig {
    /// Project reference, the first label of the project host
    pub fn project_ref(&self) -> Result<String> {
        let url = Url::parse(&self.project_url).map_err(|e| {
            AppError::Validation(format!("Invalid project URL '{}': {}", self.project_url, e))
        })?;
        url.host_str()
            .and_then(|host| host.split('.').next())
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::Validation("Project URL has no host".into()))
    }

    /// Direct database settings, available only with a database password
    pub fn direct_config(&self) -> Result<Option<NetworkConfig>> {
        let Some(password) = &self.db_password else {
            return Ok(None);
        };
        Ok(Some(NetworkConfig {
            host: format!("db.{}.supabase.co", self.project_ref()?),
            port: 5432,
            user: "postgres".to_string(),
            password: Some(password.clone()),
            database: "postgres".to_string(),
            ssl: true,
        }))
    }
}

/// Engine-tagged configuration. Exactly one variant's fields are populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum ConnectionConfig {
    #[serde(rename = "postgresql")]
    Postgres(NetworkConfig),
    MySql(NetworkConfig),
    Sqlite(SqliteConfig),
    Supabase(SupabaseConfig),
}

impl ConnectionConfig {
    pub fn engine(&self) -> Engine {
        match self {
            ConnectionConfig::Postgres(_) => Engine::Postgres,
            ConnectionConfig::MySql(_) => Engine::MySql,
            ConnectionConfig::Sqlite(_) => Engine::Sqlite,
            ConnectionConfig::Supabase(_) => Engine::Supabase,
        }
    }

    /// Parse a stored config document
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawConnectionConfig = serde_json::from_value(value)?;
        raw.normalize()
    }
}

/// Loosely-typed config as users and older records submit it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConnectionConfig {
    #[serde(alias = "type", alias = "engine")]
    pub db_type: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(alias = "database_name", alias = "db")]
    pub database: Option<String>,
    pub ssl: Option<bool>,
    #[serde(alias = "file_path", alias = "filename")]
    pub path: Option<String>,
    #[serde(alias = "url", alias = "supabase_url")]
    pub project_url: Option<String>,
    #[serde(alias = "api_key")]
    pub anon_key: Option<String>,
    #[serde(alias = "service_key")]
    pub service_role_key: Option<String>,
    pub db_password: Option<String>,
}

impl RawConnectionConfig {
    /// Validate and normalize into the typed union.
    ///
    /// `user` wins when set; otherwise `username` is used.
    pub fn normalize(self) -> Result<ConnectionConfig> {
        let engine = Engine::parse(&self.db_type)?;
        match engine {
            Engine::Postgres => Ok(ConnectionConfig::Postgres(self.network(engine)?)),
            Engine::MySql => Ok(ConnectionConfig::MySql(self.network(engine)?)),
            Engine::Sqlite => Ok(ConnectionConfig::Sqlite(SqliteConfig {
                path: non_empty(self.path).map(PathBuf::from),
            })),
            Engine::Supabase => {
                let config = SupabaseConfig {
                    project_url: required(self.project_url, "project_url")?,
                    anon_key: required(self.anon_key, "anon_key")?,
                    service_role_key: required(self.service_role_key, "service_role_key")?,
                    db_password: non_empty(self.db_password),
                };
                config.project_ref()?;
                Ok(ConnectionConfig::Supabase(config))
            }
        }
    }

    fn network(self, engine: Engine) -> Result<NetworkConfig> {
        let user = non_empty(self.user).or_else(|| non_empty(self.username));
        Ok(NetworkConfig {
            host: required(self.host, "host")?,
            port: self.port.or(engine.default_port()).unwrap_or_default(),
            user: user.ok_or_else(|| {
                AppError::Validation(format!("Missing required field 'user' for {}", engine))
            })?,
            password: self.password,
            database: required(self.database, "database")?,
            ssl: self.ssl.unwrap_or(false),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    non_empty(value)
        .ok_or_else(|| AppError::Validation(format!("Missing required field '{}'", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_takes_precedence_over_username() {
        let config = ConnectionConfig::from_value(json!({
            "type": "postgresql",
            "host": "db.local",
            "user": "primary",
            "username": "alias",
            "database": "app",
        }))
        .unwrap();
        let ConnectionConfig::Postgres(net) = config else {
            panic!("expected postgres config");
        };
        assert_eq!(net.user, "primary");
        assert_eq!(net.port, 5432);
        assert!(!net.ssl);
    }

    #[test]
    fn test_username_fallback_and_mysql_port() {
        let config = ConnectionConfig::from_value(json!({
            "type": "mysql",
            "host": "db.local",
            "username": "alias",
            "database": "app",
            "ssl": true,
        }))
        .unwrap();
        let ConnectionConfig::MySql(net) = config else {
            panic!("expected mysql config");
        };
        assert_eq!(net.user, "alias");
        assert_eq!(net.port, 3306);
        assert!(net.ssl);
    }

    #[test]
    fn test_blank_user_falls_back_to_username() {
        let raw = RawConnectionConfig {
            db_type: "postgres".into(),
            host: Some("h".into()),
            user: Some("  ".into()),
            username: Some("alias".into()),
            database: Some("d".into()),
            ..Default::default()
        };
        let ConnectionConfig::Postgres(net) = raw.normalize().unwrap() else {
            panic!("expected postgres config");
        };
        assert_eq!(net.user, "alias");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = ConnectionConfig::from_value(json!({"type": "postgresql", "host": "h"}))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_unsupported_engine() {
        let err = ConnectionConfig::from_value(json!({"type": "unsupported"})).unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("unsupported")));
    }

    #[test]
    fn test_sqlite_without_path_is_in_memory() {
        let config = ConnectionConfig::from_value(json!({"type": "sqlite"})).unwrap();
        assert_eq!(config, ConnectionConfig::Sqlite(SqliteConfig { path: None }));
    }

    #[test]
    fn test_supabase_direct_config() {
        let config = ConnectionConfig::from_value(json!({
            "type": "supabase",
            "url": "https://abcdefgh.supabase.co",
            "anon_key": "anon",
            "service_key": "service",
            "db_password": "secret",
        }))
        .unwrap();
        let ConnectionConfig::Supabase(cfg) = config else {
            panic!("expected supabase config");
        };
        let direct = cfg.direct_config().unwrap().unwrap();
        assert_eq!(direct.host, "db.abcdefgh.supabase.co");
        assert!(direct.ssl);

        let without_password = SupabaseConfig {
            db_password: None,
            ..cfg
        };
        assert!(without_password.direct_config().unwrap().is_none());
    }

    #[test]
    fn test_pool_defaults_differ_per_engine() {
        assert_eq!(Engine::Postgres.pool_defaults().max_connections, 20);
        assert_eq!(Engine::MySql.pool_defaults().max_connections, 10);
        assert_ne!(
            Engine::Postgres.pool_defaults().connect_timeout,
            Engine::MySql.pool_defaults().connect_timeout
        );
    }
}
