//! In-memory definition store.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::{IterFn, Store};
use crate::transaction::Definition;
use crate::util::SyncMap;

/// A non-durable store backed by a concurrent map. Selected by `memory:-`.
pub struct MemoryStore {
    data: SyncMap<Definition>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: SyncMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.data.contains(name))
    }

    async fn get(&self, name: &str) -> Result<Definition, StoreError> {
        self.data
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn set(&self, name: &str, definition: &Definition) -> Result<(), StoreError> {
        self.data.insert(name, definition.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.data
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn iter(&self, callback: IterFn<'_>) -> Result<(), StoreError> {
        self.data.for_each(|name, definition| callback(name, definition));
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> Definition {
        Definition {
            name: name.to_string(),
            driver: "scripted".to_string(),
            script: "fn run(ctx) {}".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        let def = definition("a");
        store.set("a", &def).await.unwrap();
        assert!(store.has("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), def);
    }

    #[tokio::test]
    async fn delete_then_absent() {
        let store = MemoryStore::new();
        store.set("a", &definition("a")).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.has("a").await.unwrap());
        assert!(matches!(
            store.delete("a").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn iter_visits_all_and_stops() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c"] {
            store.set(name, &definition(name)).await.unwrap();
        }

        let mut count = 0;
        store
            .iter(&mut |_, _| {
                count += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(count, 3);

        let mut stopped = 0;
        store
            .iter(&mut |_, _| {
                stopped += 1;
                false
            })
            .await
            .unwrap();
        assert_eq!(stopped, 1);
    }
}
