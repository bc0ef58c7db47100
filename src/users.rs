//! Tenant enumeration from the bucket
//!
//! Tenants are the top-level prefixes of the bucket. A tenant carrying a
//! tenant-deletion-mark is reported separately so the cleaner can drive its
//! two-phase teardown instead of regular cleanup.

use crate::block::TENANT_DELETION_MARK_FILENAME;
use crate::bucket::{Bucket, UserBucket};
use crate::ring::{hash_key, lookup_owners, shuffle_shard, InstanceState, Ring};
use crate::Result;

use chrono::Utc;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub type UserId = String;

/// Enumerates tenants from bucket truth.
#[async_trait]
pub trait UsersScanner: Send + Sync + 'static {
    /// Returns `(active, deleted)` tenant id lists, both sorted.
    async fn scan(&self) -> Result<(Vec<UserId>, Vec<UserId>)>;
}

/// Scans tenants with a single prefix enumeration of the bucket root,
/// deduplicating top-level path segments.
pub struct ListScanner {
    bucket: Arc<dyn Bucket>,
}

impl ListScanner {
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl UsersScanner for ListScanner {
    async fn scan(&self) -> Result<(Vec<UserId>, Vec<UserId>)> {
        let keys = self.bucket.list("").await?;
        let users: BTreeSet<&str> = keys
            .iter()
            .filter_map(|key| key.split_once('/').map(|(user, _)| user))
            .collect();

        let mut active = Vec::new();
        let mut deleted = Vec::new();
        for user in users {
            let user_bucket = UserBucket::new(Arc::clone(&self.bucket), user);
            if user_bucket.exists(TENANT_DELETION_MARK_FILENAME).await? {
                deleted.push(user.to_string());
            } else {
                active.push(user.to_string());
            }
        }
        debug!(active = active.len(), deleted = deleted.len(), "scanned bucket tenants");
        Ok((active, deleted))
    }
}

/// Decides whether the local instance owns a tenant.
#[async_trait]
pub trait ShardFilter: Send + Sync + 'static {
    async fn owns(&self, user: &str) -> Result<bool>;
}

/// Keeps only tenants whose hashed id the local instance owns per the ring.
///
/// An instance that is neither ACTIVE nor JOINING owns nothing: it must not
/// mutate state it does not own.
pub struct RingShardFilter {
    ring: Arc<Ring>,
    instance_id: String,
}

impl RingShardFilter {
    pub fn new(ring: Arc<Ring>, instance_id: &str) -> Self {
        Self {
            ring,
            instance_id: instance_id.to_string(),
        }
    }
}

#[async_trait]
impl ShardFilter for RingShardFilter {
    async fn owns(&self, user: &str) -> Result<bool> {
        match self.ring.instance_state(&self.instance_id).await? {
            Some(InstanceState::Active) | Some(InstanceState::Joining) => {}
            _ => return Ok(false),
        }
        self.ring.is_owned_by(hash_key(user), &self.instance_id).await
    }
}

/// Shuffle-sharding ownership: the tenant's work is resolved inside its
/// deterministic sub-ring of `tenant_shard_size` instances, bounding a
/// tenant's blast radius to that subset.
pub struct ShuffleShardFilter {
    ring: Arc<Ring>,
    instance_id: String,
    tenant_shard_size: usize,
}

impl ShuffleShardFilter {
    pub fn new(ring: Arc<Ring>, instance_id: &str, tenant_shard_size: usize) -> Self {
        Self {
            ring,
            instance_id: instance_id.to_string(),
            tenant_shard_size,
        }
    }
}

#[async_trait]
impl ShardFilter for ShuffleShardFilter {
    async fn owns(&self, user: &str) -> Result<bool> {
        let desc = self.ring.describe().await?;
        match desc.instances.get(&self.instance_id).map(|i| i.state) {
            Some(InstanceState::Active) | Some(InstanceState::Joining) => {}
            _ => return Ok(false),
        }

        let shard = shuffle_shard(&desc, user, self.tenant_shard_size);
        let cfg = self.ring.config();
        let owners = lookup_owners(
            &shard,
            hash_key(user),
            cfg.replication_factor,
            Utc::now().timestamp(),
            cfg.heartbeat_timeout,
            cfg.strategy,
        );
        Ok(owners.iter().any(|id| id == &self.instance_id))
    }
}

/// Wraps any scanner with an ownership predicate.
pub struct ShardedScanner {
    inner: Box<dyn UsersScanner>,
    filter: Arc<dyn ShardFilter>,
}

impl ShardedScanner {
    pub fn new(inner: Box<dyn UsersScanner>, filter: Arc<dyn ShardFilter>) -> Self {
        Self { inner, filter }
    }

    async fn filter_owned(&self, users: Vec<UserId>) -> Result<Vec<UserId>> {
        let mut owned = Vec::with_capacity(users.len());
        for user in users {
            if self.filter.owns(&user).await? {
                owned.push(user);
            }
        }
        Ok(owned)
    }
}

#[async_trait]
impl UsersScanner for ShardedScanner {
    async fn scan(&self) -> Result<(Vec<UserId>, Vec<UserId>)> {
        let (active, deleted) = self.inner.scan().await?;
        Ok((
            self.filter_owned(active).await?,
            self.filter_owned(deleted).await?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{write_tenant_deletion_mark, TenantDeletionMark};
    use crate::bucket::ObjectStoreBucket;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    async fn seeded_bucket() -> Arc<dyn Bucket> {
        let bucket: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())));
        for key in ["user-1/b/meta.json", "user-2/b/meta.json", "user-3/b/meta.json"] {
            bucket.upload(key, Bytes::from_static(b"{}")).await.unwrap();
        }
        let user3 = UserBucket::new(Arc::clone(&bucket), "user-3");
        write_tenant_deletion_mark(&user3, &TenantDeletionMark::new(100))
            .await
            .unwrap();
        bucket
    }

    #[tokio::test]
    async fn test_list_scanner_separates_deleted_tenants() {
        let bucket = seeded_bucket().await;
        let scanner = ListScanner::new(bucket);

        let (active, deleted) = scanner.scan().await.unwrap();
        assert_eq!(active, vec!["user-1".to_string(), "user-2".to_string()]);
        assert_eq!(deleted, vec!["user-3".to_string()]);
    }

    struct StaticFilter(Vec<&'static str>);

    #[async_trait]
    impl ShardFilter for StaticFilter {
        async fn owns(&self, user: &str) -> Result<bool> {
            Ok(self.0.contains(&user))
        }
    }

    #[tokio::test]
    async fn test_sharded_scanner_applies_predicate() {
        let bucket = seeded_bucket().await;
        let scanner = ShardedScanner::new(
            Box::new(ListScanner::new(bucket)),
            Arc::new(StaticFilter(vec!["user-2", "user-3"])),
        );

        let (active, deleted) = scanner.scan().await.unwrap();
        assert_eq!(active, vec!["user-2".to_string()]);
        assert_eq!(deleted, vec!["user-3".to_string()]);
    }

    #[tokio::test]
    async fn test_sharded_scanner_empty_for_unowned_instance() {
        let bucket = seeded_bucket().await;
        let scanner = ShardedScanner::new(
            Box::new(ListScanner::new(bucket)),
            Arc::new(StaticFilter(vec![])),
        );

        let (active, deleted) = scanner.scan().await.unwrap();
        assert!(active.is_empty());
        assert!(deleted.is_empty());
    }
}
