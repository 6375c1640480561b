//! Object-storage definition store (S3-compatible).

use async_trait::async_trait;
use futures_util::TryStreamExt;
use object_store::ObjectStore as _;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;

use crate::error::StoreError;
use crate::store::{IterFn, Store};
use crate::transaction::Definition;

/// A store keeping one JSON object per definition under a bucket prefix.
/// Selected by `s3://<access>:<secret>@<bucket>/<prefix>?region=<r>`.
pub struct ObjectStore {
    bucket: AmazonS3,
    prefix: String,
}

impl ObjectStore {
    pub fn open(uri: &str) -> Result<Self, StoreError> {
        let parsed = url::Url::parse(uri).map_err(|e| StoreError::InvalidUri(e.to_string()))?;
        if parsed.scheme() != "s3" {
            return Err(StoreError::InvalidUri(uri.to_string()));
        }

        let bucket_name = parsed
            .host_str()
            .ok_or_else(|| StoreError::InvalidUri("missing bucket".to_string()))?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket_name);

        if !parsed.username().is_empty() {
            builder = builder.with_access_key_id(parsed.username());
        }
        if let Some(secret) = parsed.password() {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some((_, region)) = parsed.query_pairs().find(|(k, _)| k == "region") {
            builder = builder.with_region(region.to_string());
        }

        let bucket = builder
            .build()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            bucket,
            prefix: parsed.path().trim_matches('/').to_string(),
        })
    }

    fn location(&self, name: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(name)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, name))
        }
    }
}

#[async_trait]
impl Store for ObjectStore {
    async fn has(&self, name: &str) -> Result<bool, StoreError> {
        match self.bucket.head(&self.location(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn get(&self, name: &str) -> Result<Definition, StoreError> {
        let result = match self.bucket.get(&self.location(name)).await {
            Ok(r) => r,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(StoreError::Backend(e.to_string())),
        };

        let data = result
            .bytes()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn set(&self, name: &str, definition: &Definition) -> Result<(), StoreError> {
        let data = serde_json::to_vec(definition)?;
        self.bucket
            .put(&self.location(name), data.into())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        // S3 deletes are idempotent, check existence to honour NotFound.
        if !self.has(name).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.bucket
            .delete(&self.location(name))
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn iter(&self, callback: IterFn<'_>) -> Result<(), StoreError> {
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.prefix.as_str()))
        };

        let mut listing = self.bucket.list(prefix.as_ref());
        while let Some(meta) = listing
            .try_next()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            let name = meta
                .location
                .filename()
                .unwrap_or_default()
                .to_string();
            let definition = self.get(&name).await?;
            if !callback(&name, &definition) {
                break;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credentials_bucket_prefix_and_region() {
        let store =
            ObjectStore::open("s3://AKID:sekret@probes/monitoring/prod?region=eu-west-1").unwrap();
        assert_eq!(store.prefix, "monitoring/prod");
        assert_eq!(
            store.location("checkout").as_ref(),
            "monitoring/prod/checkout"
        );
    }

    #[test]
    fn empty_prefix_keys_at_root() {
        let store = ObjectStore::open("s3://AKID:sekret@probes?region=us-east-1").unwrap();
        assert_eq!(store.location("checkout").as_ref(), "checkout");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            ObjectStore::open("gs://bucket/prefix"),
            Err(StoreError::InvalidUri(_))
        ));
    }
}
