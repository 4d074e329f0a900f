//! `MapStoreHandle` trait — the storage interface a Context is built on.
//!
//! Implemented by the local [`MapStore`](super::MapStore) on the supervisor
//! side and by the worker's broker, which forwards every call over the
//! process channel to that same store.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::protocol::StorageOp;

/// A plain key/value object stored under one `mapId`.
pub type StoredMap = Map<String, Value>;

/// Backend-agnostic access to named maps.
#[async_trait]
pub trait MapStoreHandle: Send + Sync {
    /// Run one operation and return its raw JSON result.
    async fn apply(&self, op: StorageOp) -> Result<Value, StoreError>;

    /// Fetch a whole map, `{}` when it does not exist.
    async fn get(&self, map_id: &str) -> Result<StoredMap, StoreError> {
        let value = self
            .apply(StorageOp::Get {
                map_id: map_id.to_string(),
            })
            .await?;
        match value {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(StoredMap::new()),
            other => Err(StoreError::Corrupt(format!(
                "map {map_id} is not an object: {other}"
            ))),
        }
    }

    /// Replace a whole map. `map` must be a plain object.
    async fn set(&self, map_id: &str, map: Value) -> Result<(), StoreError> {
        self.apply(StorageOp::Set {
            map_id: map_id.to_string(),
            value: map,
        })
        .await
        .map(|_| ())
    }

    async fn del(&self, map_id: &str) -> Result<(), StoreError> {
        self.apply(StorageOp::Del {
            map_id: map_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn get_item(&self, map_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let value = self
            .apply(StorageOp::GetItem {
                map_id: map_id.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn set_item(&self, map_id: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.apply(StorageOp::SetItem {
            map_id: map_id.to_string(),
            key: key.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn del_item(&self, map_id: &str, key: &str) -> Result<(), StoreError> {
        self.apply(StorageOp::DelItem {
            map_id: map_id.to_string(),
            key: key.to_string(),
        })
        .await
        .map(|_| ())
    }
}
