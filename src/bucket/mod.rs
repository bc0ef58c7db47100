//! Object bucket abstraction
//!
//! A flat key→bytes store with per-object atomicity and no cross-object
//! transaction. Every higher component assumes a crash can happen between
//! any two bucket calls. Decorators compose cross-cutting behavior:
//!
//! - [`UserBucket`]: scopes all keys under `<tenant>/`
//! - [`GlobalMarkersBucket`]: mirrors per-block deletion marks to the
//!   tenant-level `markers/` location
//! - [`HedgedBucket`]: duplicates reads after a delay under tail latency

mod global_markers;
mod hedged;
mod prefix;

pub use global_markers::GlobalMarkersBucket;
pub use hedged::{HedgedBucket, HedgedRequestConfig};
pub use prefix::UserBucket;

use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Flat key→bytes storage contract.
///
/// Writes to distinct keys are independent; there is no ordering across keys.
/// `delete` of an absent key succeeds — idempotent deletes let multi-object
/// sequences resume from bucket truth after a mid-sequence crash.
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    /// Fetch the object at `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Atomically write the object at `key`, replacing any previous content.
    async fn upload(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete the object at `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List all object keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Adapter exposing any [`object_store::ObjectStore`] as a [`Bucket`].
///
/// Classifies backend errors into the two kinds the lifecycle core must
/// distinguish: not-found (usually a concurrent deletion, safe to treat as
/// success for idempotent operations) and access-denied (never transient,
/// quarantines the tenant via sync status).
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

fn classify(key: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => Error::NotFound {
            key: key.to_string(),
        },
        object_store::Error::PermissionDenied { .. } | object_store::Error::Unauthenticated { .. } => {
            Error::AccessDenied {
                key: key.to_string(),
            }
        }
        other => Error::ObjectStore(other),
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| classify(key, e))?;
        result.bytes().await.map_err(|e| classify(key, e))
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), PutPayload::from(data))
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(classify(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = if prefix.is_empty() {
            None
        } else {
            Some(Path::from(prefix))
        };
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(path.as_ref())
            .try_collect()
            .await
            .map_err(|e| classify(prefix, e))?;
        Ok(metas.into_iter().map(|m| m.location.to_string()).collect())
    }
}

/// Fetch and deserialize a JSON object.
pub async fn get_json<T: DeserializeOwned>(bucket: &dyn Bucket, key: &str) -> Result<T> {
    let bytes = bucket.get(key).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Serialize and upload a JSON object.
pub async fn upload_json<T: Serialize>(bucket: &dyn Bucket, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    bucket.upload(key, Bytes::from(bytes)).await
}
