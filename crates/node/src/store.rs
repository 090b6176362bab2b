//! String key value store holding active-set snapshots and listener watermarks.

use async_trait::async_trait;
use dashmap::DashMap;
use reth_db::Database;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::RwLock;

use crate::error::{ErrorKind, HasKind};

/// Store errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// database error
    #[error("database: {0}")]
    Database(#[from] orakl_db::Error),
    /// stored value is not the expected json shape
    #[error("value under {key} is malformed: {source}")]
    Json {
        /// Key of the malformed value.
        key: String,
        /// Decoding error.
        source: serde_json::Error,
    },
    /// the store was closed
    #[error("store is closed")]
    Closed,
}

impl HasKind for StoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Store
    }
}

/// Async string key value store.
#[async_trait]
pub trait KvStore: fmt::Debug + Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Release the underlying storage. Later calls fail with [`StoreError::Closed`].
    async fn close(&self);
}

/// Read a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    store
        .get(key)
        .await?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|source| StoreError::Json { key: key.to_string(), source })
}

/// Write a JSON value.
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)
        .map_err(|source| StoreError::Json { key: key.to_string(), source })?;
    store.set(key, raw).await
}

/// [`KvStore`] on an MDBX environment.
pub struct MdbxStore<D> {
    db: RwLock<Option<Arc<D>>>,
}

impl<D> fmt::Debug for MdbxStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MdbxStore").finish_non_exhaustive()
    }
}

impl<D: Database + 'static> MdbxStore<D> {
    /// Create a new [Self].
    pub fn new(db: Arc<D>) -> Self {
        Self { db: RwLock::new(Some(db)) }
    }

    async fn db(&self) -> Result<Arc<D>, StoreError> {
        self.db.read().await.clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl<D: Database + 'static> KvStore for MdbxStore<D> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(orakl_db::get_value(self.db().await?, key.to_string()).await?)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        Ok(orakl_db::put_value(self.db().await?, key.to_string(), value).await?)
    }

    async fn close(&self) {
        self.db.write().await.take();
    }
}

/// In-process [`KvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
}

impl MemoryStore {
    /// Create a new [Self].
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mdbx_store_closes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MdbxStore::new(orakl_db::init_db(dir.path()).unwrap());

        set_json(&store, "dev-listener-vrf-state", &vec!["1", "2"]).await.unwrap();
        let ids: Option<Vec<String>> = get_json(&store, "dev-listener-vrf-state").await.unwrap();
        assert_eq!(ids, Some(vec!["1".to_string(), "2".to_string()]));
        assert_eq!(store.get("dev-listener-aggregator-state").await.unwrap(), None);

        store.close().await;
        assert!(matches!(store.get("anything").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn malformed_json_is_reported() {
        let store = MemoryStore::new();
        store.set("listener:0x01", "not a number".to_string()).await.unwrap();
        let result: Result<Option<u64>, _> = get_json(&store, "listener:0x01").await;
        assert!(matches!(result, Err(StoreError::Json { .. })));
    }
}
