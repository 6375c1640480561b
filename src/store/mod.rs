//! Durable catalogue of transaction definitions.
//!
//! Backends are selected by URI scheme: `memory:-` for the in-process map,
//! `sled:<path>` for the on-disk key-value store, and
//! `s3://<access>:<secret>@<bucket>/<prefix>?region=<r>` for object storage.
//! Definitions are persisted as JSON.

pub mod disk;
pub mod memory;
pub mod object;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::transaction::Definition;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use object::ObjectStore;

/// Iteration callback. Returning false stops the iteration.
pub type IterFn<'a> = &'a mut (dyn FnMut(&str, &Definition) -> bool + Send);

/// Storage for transaction definitions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Check if a definition exists under the given name.
    async fn has(&self, name: &str) -> Result<bool, StoreError>;

    /// Fetch a definition by name.
    async fn get(&self, name: &str) -> Result<Definition, StoreError>;

    /// Persist the given definition under `name`, replacing any previous one.
    async fn set(&self, name: &str, definition: &Definition) -> Result<(), StoreError>;

    /// Delete the definition for the given name.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Iterate over all definitions. Order is backend-defined but stable
    /// within a single call.
    async fn iter(&self, callback: IterFn<'_>) -> Result<(), StoreError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Open a store from a `<scheme>:<rest>` URI.
pub async fn open(uri: &str) -> Result<Box<dyn Store>, StoreError> {
    let (scheme, _) = uri
        .split_once(':')
        .ok_or_else(|| StoreError::InvalidUri(uri.to_string()))?;

    match scheme {
        "memory" => Ok(Box::new(MemoryStore::new())),
        "sled" => Ok(Box::new(DiskStore::open(uri)?)),
        "s3" => Ok(Box::new(ObjectStore::open(uri)?)),
        other => Err(StoreError::UnknownScheme(other.to_string())),
    }
}
