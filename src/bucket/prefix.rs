//! User-scoping bucket decorator

use super::Bucket;
use crate::Result;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Scopes every key of the wrapped bucket under `<tenant>/`.
///
/// Keys passed in (and returned from `list`) are relative to the tenant
/// prefix, so per-tenant components never see other tenants' objects.
pub struct UserBucket {
    inner: Arc<dyn Bucket>,
    prefix: String,
}

impl UserBucket {
    pub fn new(inner: Arc<dyn Bucket>, user_id: &str) -> Self {
        Self {
            inner,
            prefix: format!("{}/", user_id.trim_end_matches('/')),
        }
    }

    pub fn user_id(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl Bucket for UserBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(&self.full_key(key)).await
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.upload(&self.full_key(key), data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.full_key(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.full_key(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self.inner.list(&self.full_key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ObjectStoreBucket;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_scopes_keys_under_tenant() {
        let root: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())));
        let user = UserBucket::new(root.clone(), "user-1");

        user.upload("block/meta.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert!(root.exists("user-1/block/meta.json").await.unwrap());
        assert!(user.exists("block/meta.json").await.unwrap());
        assert_eq!(user.user_id(), "user-1");
    }

    #[tokio::test]
    async fn test_list_returns_relative_keys() {
        let root: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())));
        root.upload("user-1/a/meta.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        root.upload("user-2/b/meta.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let user = UserBucket::new(root, "user-1");
        let keys = user.list("").await.unwrap();
        assert_eq!(keys, vec!["a/meta.json".to_string()]);
    }
}
