//! On-disk definition store backed by sled.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{IterFn, Store};
use crate::transaction::Definition;

/// A durable store on the local filesystem. Selected by `sled:<path>`.
///
/// Keys are definition names; values are JSON. Iteration follows sled's
/// sorted key order.
pub struct DiskStore {
    db: sled::Db,
}

impl DiskStore {
    /// Open (or create) the database at the path encoded in the URI.
    pub fn open(uri: &str) -> Result<Self, StoreError> {
        let path = uri
            .strip_prefix("sled:")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StoreError::InvalidUri(uri.to_string()))?;

        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        self.db
            .contains_key(name)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn get(&self, name: &str) -> Result<Definition, StoreError> {
        let value = self
            .db
            .get(name)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        Ok(serde_json::from_slice(&value)?)
    }

    async fn set(&self, name: &str, definition: &Definition) -> Result<(), StoreError> {
        let value = serde_json::to_vec(definition)?;
        self.db
            .insert(name, value)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.db
            .remove(name)
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(())
    }

    async fn iter(&self, callback: IterFn<'_>) -> Result<(), StoreError> {
        for entry in self.db.iter() {
            let (key, value) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            let name = String::from_utf8_lossy(&key);
            let definition: Definition = serde_json::from_slice(&value)?;
            if !callback(&name, &definition) {
                break;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}
