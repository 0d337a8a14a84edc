//! Blob persistence adapters.
//!
//! The engine only needs `put/get/delete` on opaque byte blobs. Datasets,
//! execution outputs and persisted cache entries all travel through this
//! contract, so any document, relational or cache store can back it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::dataset::Dataset;
use crate::error::StoreError;

/// Opaque reference to a dataset held in a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataRef(String);

impl DataRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DataRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniform persistence capability.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value.
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch the blob under `key`; `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared handle to a blob store.
pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Serialize and store a dataset.
pub async fn save_dataset(
    store: &dyn BlobStore,
    data_ref: &DataRef,
    dataset: &Dataset,
) -> Result<(), StoreError> {
    let blob = serde_json::to_vec(dataset)?;
    store.put(data_ref.as_str(), blob).await
}

/// Load and decode a dataset; a missing key is an error here.
///
/// Rows are padded or truncated to the header width, so a blob written by
/// another producer never reaches the engine ragged.
pub async fn load_dataset(store: &dyn BlobStore, data_ref: &DataRef) -> Result<Dataset, StoreError> {
    let blob = store
        .get(data_ref.as_str())
        .await?
        .ok_or_else(|| StoreError::NotFound(data_ref.to_string()))?;
    let decode_error = |e: serde_json::Error| StoreError::Decode {
        key: data_ref.to_string(),
        reason: e.to_string(),
    };
    let value: serde_json::Value = serde_json::from_slice(&blob).map_err(decode_error)?;
    Dataset::from_json_value(value).map_err(decode_error)
}

/// Process-local store, used by tests and single-node runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError> {
        self.blobs.write().await.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}

/// Redis-backed store.
///
/// Keys are namespaced with a prefix; an optional expiry is applied on every
/// `put` so results age out of Redis on the same schedule as the cache.
pub struct RedisBlobStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    expiry: Option<Duration>,
}

impl RedisBlobStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Namespace prepended to every key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            expiry: None,
        }
    }

    /// Expire every written key after `expiry`.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let full_key = self.key(key);
        match self.expiry {
            Some(expiry) => {
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(blob)
                    .arg("EX")
                    .arg(expiry.as_secs().max(1))
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
            None => conn.set::<_, _, ()>(&full_key, blob).await?,
        }
        debug!(key = %full_key, "Stored blob in Redis");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<Vec<u8>> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_memory_store_put_get_delete() {
        let store = MemoryBlobStore::new();
        assert!(store.get("k").await.expect("get").is_none());

        store.put("k", b"v1".to_vec()).await.expect("put");
        store.put("k", b"v2".to_vec()).await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v2".to_vec()));
        assert_eq!(store.len().await, 1);

        store.delete("k").await.expect("delete");
        store.delete("k").await.expect("delete twice");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_dataset_round_trip_through_store() {
        let store = MemoryBlobStore::new();
        let data_ref = DataRef::new("raw/orders");
        let ds = Dataset::from_json_value(json!([{"a": 1}, {"a": 2}])).expect("dataset");

        save_dataset(&store, &data_ref, &ds).await.expect("save");
        let loaded = load_dataset(&store, &data_ref).await.expect("load");
        assert_eq!(loaded, ds);
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupt_dataset() {
        let store = MemoryBlobStore::new();
        let missing = load_dataset(&store, &DataRef::new("nope")).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        store.put("bad", b"not json".to_vec()).await.expect("put");
        let corrupt = load_dataset(&store, &DataRef::new("bad")).await;
        assert!(matches!(corrupt, Err(StoreError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_load_pads_ragged_rows() {
        let store = MemoryBlobStore::new();
        let blob = br#"{"columns":["age","city"],"rows":[[1,"a"],[null],[3,"c","extra"]]}"#;
        store.put("ragged", blob.to_vec()).await.expect("put");

        let loaded = load_dataset(&store, &DataRef::new("ragged")).await.expect("load");
        assert!(loaded.rows.iter().all(|row| row.len() == 2));
        assert_eq!(loaded.rows[1], vec![Value::Null, Value::Null]);
        assert_eq!(loaded.rows[2], vec![json!(3), json!("c")]);
    }
}
