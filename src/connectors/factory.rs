//! Connector factory
//!
//! Resolves a configuration's engine discriminator to a concrete connector.
//! Validation happens entirely before construction, so an unsupported engine
//! or malformed config never yields a partially built connector.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::config::{ConnectionConfig, RawConnectionConfig};
use super::mysql::MySqlConnector;
use super::postgres::PostgresConnector;
use super::sqlite::SqliteConnector;
use super::supabase::SupabaseConnector;
use super::Connector;
use crate::error::Result;

/// Build a connector from an already normalized config
pub fn create_connector(id: &str, config: ConnectionConfig) -> Result<Arc<dyn Connector>> {
    debug!(connection_id = %id, engine = %config.engine(), "Creating connector");
    let connector: Arc<dyn Connector> = match config {
        ConnectionConfig::Postgres(settings) => Arc::new(PostgresConnector::new(id, settings)),
        ConnectionConfig::MySql(settings) => Arc::new(MySqlConnector::new(id, settings)),
        ConnectionConfig::Sqlite(settings) => Arc::new(SqliteConnector::new(id, settings)),
        ConnectionConfig::Supabase(settings) => Arc::new(SupabaseConnector::new(id, settings)?),
    };
    Ok(connector)
}

/// Normalize loosely-typed input, then build
pub fn create_from_raw(id: &str, raw: RawConnectionConfig) -> Result<Arc<dyn Connector>> {
    create_connector(id, raw.normalize()?)
}

/// Parse a stored config document, then build
pub fn create_from_value(id: &str, value: Value) -> Result<Arc<dyn Connector>> {
    create_connector(id, ConnectionConfig::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Engine;
    use crate::error::AppError;
    use serde_json::json;

    #[test]
    fn test_unsupported_engine_builds_nothing() {
        let result = create_from_value("c1", json!({"type": "unsupported"}));
        match result {
            Err(AppError::Validation(msg)) => assert!(msg.contains("unsupported")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connector should not be constructed"),
        }
    }

    #[test]
    fn test_dispatch_by_engine() {
        let pg = create_from_value(
            "pg",
            json!({"type": "postgres", "host": "h", "username": "u", "database": "d"}),
        )
        .unwrap();
        assert_eq!(pg.engine(), Engine::Postgres);
        assert_eq!(pg.default_schema(), "public");

        let my = create_from_value(
            "my",
            json!({"type": "mariadb", "host": "h", "user": "u", "database": "shop"}),
        )
        .unwrap();
        assert_eq!(my.engine(), Engine::MySql);
        assert_eq!(my.default_schema(), "shop");

        let lite = create_from_value("lite", json!({"type": "sqlite3"})).unwrap();
        assert_eq!(lite.engine(), Engine::Sqlite);
        assert!(lite.introspection().is_some());
    }

    #[tokio::test]
    async fn test_same_config_yields_independent_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = json!({"type": "sqlite", "path": dir.path().join("shared.db")});

        let first = create_from_value("same", config.clone()).unwrap();
        let second = create_from_value("same", config).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        first.connect().await.unwrap();
        assert!(first.state().is_connected);
        assert!(!second.state().is_connected);

        first.disconnect().await.unwrap();
        second.connect().await.unwrap();
        assert!(!first.state().is_connected);
        assert!(second.state().is_connected);
        second.disconnect().await.unwrap();
    }
}
