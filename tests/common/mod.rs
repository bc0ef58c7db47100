//! Shared fixtures for integration tests

#![allow(dead_code)]

use basalt::block::{
    deletion_mark_path, meta_path, no_compact_mark_path, parquet_converter_mark_path, BlockId,
    BlockMeta, DeletionMark, DeletionReason, NoCompactMark, ParquetConverterMark,
    BLOCK_VISIT_MARKER_FILENAME,
};
use basalt::bucket::{upload_json, Bucket, GlobalMarkersBucket, ObjectStoreBucket};
use basalt::cleaner::ConfigProvider;
use basalt::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use object_store::memory::InMemory;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// A fresh in-memory bucket wrapped with global deletion-mark mirroring.
/// Returns `(decorated, raw)` — assertions usually go through `raw`.
pub fn prepare_bucket() -> (Arc<dyn Bucket>, Arc<dyn Bucket>) {
    let raw: Arc<dyn Bucket> = Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())));
    let decorated: Arc<dyn Bucket> = Arc::new(GlobalMarkersBucket::new(Arc::clone(&raw)));
    (decorated, raw)
}

pub fn block_id(n: u64) -> BlockId {
    Ulid::from_parts(n, n as u128)
}

/// Millis timestamp `hours` relative to now, truncated to seconds like the
/// shipper stamps block bounds.
pub fn ts_hours(hours: i64) -> i64 {
    (Utc::now().timestamp() + hours * 3600) * 1000
}

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub async fn create_block(bucket: &Arc<dyn Bucket>, user: &str, id: BlockId, min_time: i64, max_time: i64) {
    let meta = BlockMeta {
        block_id: id,
        min_time,
        max_time,
        version: 1,
        labels: Default::default(),
    };
    upload_json(bucket.as_ref(), &format!("{user}/{}", meta_path(id)), &meta)
        .await
        .unwrap();
    bucket
        .upload(&format!("{user}/{id}/index"), Bytes::from_static(b"index"))
        .await
        .unwrap();
    bucket
        .upload(
            &format!("{user}/{id}/chunks/000001"),
            Bytes::from_static(b"chunk"),
        )
        .await
        .unwrap();
}

/// Writes a block deletion mark (the global mirror follows via the
/// decorator when `bucket` is the decorated one).
pub async fn create_deletion_mark(bucket: &Arc<dyn Bucket>, user: &str, id: BlockId, creation_time: i64) {
    let mark = DeletionMark::new(id, creation_time, DeletionReason::Manual);
    upload_json(
        bucket.as_ref(),
        &format!("{user}/{}", deletion_mark_path(id)),
        &mark,
    )
    .await
    .unwrap();
}

pub async fn create_no_compact_mark(bucket: &Arc<dyn Bucket>, user: &str, id: BlockId) {
    let mark = NoCompactMark {
        block_id: id,
        version: 1,
        no_compact_time: now_secs(),
        reason: "manual".to_string(),
    };
    upload_json(
        bucket.as_ref(),
        &format!("{user}/{}", no_compact_mark_path(id)),
        &mark,
    )
    .await
    .unwrap();
}

pub async fn create_parquet_marker(bucket: &Arc<dyn Bucket>, user: &str, id: BlockId) {
    upload_json(
        bucket.as_ref(),
        &format!("{user}/{}", parquet_converter_mark_path(id)),
        &ParquetConverterMark { version: 1 },
    )
    .await
    .unwrap();
}

pub async fn create_block_visit_marker(bucket: &Arc<dyn Bucket>, user: &str, id: BlockId) {
    bucket
        .upload(
            &format!("{user}/{id}/{BLOCK_VISIT_MARKER_FILENAME}"),
            Bytes::from_static(b"{\"owner\":\"worker-0\"}"),
        )
        .await
        .unwrap();
}

pub async fn assert_exists(bucket: &Arc<dyn Bucket>, key: &str, expected: bool) {
    let exists = bucket.exists(key).await.unwrap();
    assert_eq!(exists, expected, "unexpected existence for {key}");
}

/// Per-tenant overrides backed by plain maps, mutable mid-test.
#[derive(Default)]
pub struct MockConfigProvider {
    retention: Mutex<HashMap<String, Duration>>,
    parquet: Mutex<HashSet<String>>,
}

impl MockConfigProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_retention(&self, user: &str, retention: Duration) {
        self.retention.lock().insert(user.to_string(), retention);
    }

    pub fn enable_parquet(&self, user: &str) {
        self.parquet.lock().insert(user.to_string());
    }
}

impl ConfigProvider for MockConfigProvider {
    fn retention_period(&self, user: &str) -> Duration {
        self.retention
            .lock()
            .get(user)
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn parquet_converter_enabled(&self, user: &str) -> bool {
        self.parquet.lock().contains(user)
    }
}

/// Injects failures for specific keys, leaving everything else untouched.
pub struct FailingBucket {
    inner: Arc<dyn Bucket>,
    get_access_denied: HashSet<String>,
    delete_failures: HashSet<String>,
}

impl FailingBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self {
            inner,
            get_access_denied: HashSet::new(),
            delete_failures: HashSet::new(),
        }
    }

    pub fn deny_get(mut self, key: &str) -> Self {
        self.get_access_denied.insert(key.to_string());
        self
    }

    pub fn fail_delete(mut self, key: &str) -> Self {
        self.delete_failures.insert(key.to_string());
        self
    }
}

#[async_trait]
impl Bucket for FailingBucket {
    async fn get(&self, key: &str) -> Result<Bytes> {
        if self.get_access_denied.contains(key) {
            return Err(Error::AccessDenied {
                key: key.to_string(),
            });
        }
        self.inner.get(key).await
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.upload(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.delete_failures.contains(key) {
            return Err(Error::Internal(format!("injected delete failure for {key}")));
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}
