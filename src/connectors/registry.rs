//! Live connector cache keyed by connection id
//!
//! Every lifecycle call for one id runs under that id's async mutex, so at
//! most one `connect`/`disconnect` is in flight per connection inside this
//! process.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use super::{factory, Connector};
use crate::error::{AppError, Result};
use crate::store::ConnectionStore;

type Slot = Arc<AsyncMutex<Option<Arc<dyn Connector>>>>;

pub struct ConnectorRegistry {
    connections: Arc<dyn ConnectionStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectorRegistry {
    pub fn new(connections: Arc<dyn ConnectionStore>) -> Self {
        Self {
            connections,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, id: &str) -> Slot {
        self.slots
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Return a connected connector, building and connecting it on first use.
    /// A cached connector that lost its connection is reconnected.
    pub async fn get_or_connect(&self, id: &str) -> Result<Arc<dyn Connector>> {
        let slot = self.slot(id);
        let result = self.connect_slot(id, &slot).await;
        if result.is_err() {
            self.release_if_unused(id, &slot);
        }
        result
    }

    async fn connect_slot(&self, id: &str, slot: &Slot) -> Result<Arc<dyn Connector>> {
        let mut cached = slot.lock().await;

        if let Some(connector) = cached.as_ref() {
            if !connector.state().is_connected {
                connector.connect().await?;
            }
            return Ok(Arc::clone(connector));
        }

        let stored = self
            .connections
            .get_connection(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection not found: {}", id)))?;
        let connector = factory::create_from_value(id, stored.config)?;
        connector.connect().await?;

        info!(connection_id = %id, engine = %connector.engine(), "Connector registered");
        *cached = Some(Arc::clone(&connector));
        Ok(connector)
    }

    /// Forget a slot that holds no connector and that no other caller holds.
    /// Keeps failed lookups from leaving entries behind.
    fn release_if_unused(&self, id: &str, slot: &Slot) {
        let mut slots = self.slots.lock();
        let unused = slots
            .get(id)
            .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(held) == 2);
        if unused && slot.try_lock().is_ok_and(|cached| cached.is_none()) {
            slots.remove(id);
        }
    }

    /// Disconnect and forget a cached connector
    pub async fn evict(&self, id: &str) -> Result<()> {
        let slot = self.slots.lock().remove(id);
        let Some(slot) = slot else {
            return Ok(());
        };
        let connector = slot.lock().await.take();
        if let Some(connector) = connector {
            connector.disconnect().await?;
            info!(connection_id = %id, "Connector evicted");
        }
        Ok(())
    }

    /// Disconnect every cached connector
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.evict(&id).await {
                warn!(connection_id = %id, error = %e, "Failed to disconnect connector");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StoredConnection;
    use crate::store::MemoryStore;
    use serde_json::json;

    // Lets tests call `unwrap_err()` on `Result<Arc<dyn Connector>, _>`.
    impl std::fmt::Debug for dyn crate::connectors::Connector {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dyn Connector")
        }
    }

    async fn registry_with(config: serde_json::Value) -> ConnectorRegistry {
        let store = Arc::new(MemoryStore::new());
        store
            .save_connection(&StoredConnection {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "local".into(),
                config,
            })
            .await
            .unwrap();
        ConnectorRegistry::new(store)
    }

    #[tokio::test]
    async fn test_get_or_connect_caches_connector() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            registry_with(json!({"type": "sqlite", "path": dir.path().join("r.db")})).await;

        let first = registry.get_or_connect("c1").await.unwrap();
        let second = registry.get_or_connect("c1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.state().is_connected);
        assert_eq!(registry.len(), 1);

        registry.evict("c1").await.unwrap();
        assert!(!first.state().is_connected);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_dropped_connector() {
        let registry = registry_with(json!({"type": "sqlite"})).await;
        let connector = registry.get_or_connect("c1").await.unwrap();
        connector.disconnect().await.unwrap();

        let again = registry.get_or_connect("c1").await.unwrap();
        assert!(Arc::ptr_eq(&connector, &again));
        assert!(again.state().is_connected);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let registry = registry_with(json!({"type": "sqlite"})).await;
        let err = registry.get_or_connect("missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_lookups_leave_no_entries() {
        let registry = registry_with(json!({"type": "unsupported"})).await;
        for i in 0..100 {
            let id = format!("missing-{}", i);
            assert!(registry.get_or_connect(&id).await.is_err());
        }
        assert!(registry.get_or_connect("c1").await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_cached_connector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("r.db");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let registry = registry_with(json!({"type": "sqlite", "path": path})).await;
        let connector = registry.get_or_connect("c1").await.unwrap();
        connector.disconnect().await.unwrap();

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
        assert!(registry.get_or_connect("c1").await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_stored_config() {
        let registry = registry_with(json!({"type": "unsupported"})).await;
        let err = registry.get_or_connect("c1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
