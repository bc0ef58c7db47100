//! Global deletion-mark mirroring decorator

use super::Bucket;
use crate::block::{DELETION_MARK_FILENAME, MARKERS_DIR};
use crate::Result;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use ulid::Ulid;

/// Mirrors per-block deletion marks to the tenant-level `markers/` location.
///
/// On upload of `<tenant>/<block>/deletion-mark.json` the same payload is
/// also written to `<tenant>/markers/<block>-deletion-mark.json`, and the
/// mirror is removed symmetrically on delete. Cleaners can then enumerate
/// every deletion mark of a tenant with a single prefix listing instead of
/// one request per block.
pub struct GlobalMarkersBucket {
    inner: Arc<dyn Bucket>,
}

impl GlobalMarkersBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self { inner }
    }

    /// If `key` is a per-block deletion mark, returns the global mirror key.
    fn mirror_key(key: &str) -> Option<String> {
        let (parent, filename) = key.rsplit_once('/')?;
        if filename != DELETION_MARK_FILENAME {
            return None;
        }
        let (scope, block) = match parent.rsplit_once('/') {
            Some((scope, block)) => (Some(scope), block),
            None => (None, parent),
        };
        let block: Ulid = block.parse().ok()?;
        let mirror = format!("{MARKERS_DIR}/{block}-{DELETION_MARK_FILENAME}");
        Some(match scope {
            Some(scope) => format!("{scope}/{mirror}"),
            None => mirror,
        })
    }
}

#[async_trait]
impl Bucket for GlobalMarkersBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(key).await
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        // Upload the mirror first: if the block-level mark exists the mirror
        // must exist too, so a crash in between leaves a benign extra mirror
        // rather than an unlisted mark.
        if let Some(mirror) = Self::mirror_key(key) {
            self.inner.upload(&mirror, data.clone()).await?;
        }
        self.inner.upload(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await?;
        if let Some(mirror) = Self::mirror_key(key) {
            self.inner.delete(&mirror).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ObjectStoreBucket;
    use object_store::memory::InMemory;

    fn wrapped() -> (Arc<dyn Bucket>, Arc<dyn Bucket>) {
        let root: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())));
        let marked: Arc<dyn Bucket> = Arc::new(GlobalMarkersBucket::new(root.clone()));
        (marked, root)
    }

    #[tokio::test]
    async fn test_mirrors_deletion_mark_upload_and_delete() {
        let (bucket, root) = wrapped();
        let block = Ulid::from_parts(1, 42);
        let key = format!("user-1/{block}/deletion-mark.json");
        let mirror = format!("user-1/markers/{block}-deletion-mark.json");

        bucket.upload(&key, Bytes::from_static(b"{}")).await.unwrap();
        assert!(root.exists(&key).await.unwrap());
        assert!(root.exists(&mirror).await.unwrap());

        bucket.delete(&key).await.unwrap();
        assert!(!root.exists(&key).await.unwrap());
        assert!(!root.exists(&mirror).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_keys_are_not_mirrored() {
        let (bucket, root) = wrapped();
        let block = Ulid::from_parts(1, 42);

        bucket
            .upload(
                &format!("user-1/{block}/meta.json"),
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();
        bucket
            .upload("user-1/not-a-ulid/deletion-mark.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let keys = root.list("user-1/markers").await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_missing_mirror_succeeds() {
        let (bucket, root) = wrapped();
        let block = Ulid::from_parts(1, 42);
        let key = format!("user-1/{block}/deletion-mark.json");

        // Write the mark behind the decorator's back, then delete through it.
        root.upload(&key, Bytes::from_static(b"{}")).await.unwrap();
        bucket.delete(&key).await.unwrap();
        assert!(!root.exists(&key).await.unwrap());
    }
}
