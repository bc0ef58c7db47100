//! Per-tenant bucket index
//!
//! A compressed manifest of live blocks, deletion marks, and sync status,
//! written only by the blocks cleaner and read by queriers and
//! store-gateways. The index is a cache of bucket truth: it may lag by up to
//! one cleaner interval and is never the sole source of truth for deletion.

mod updater;

pub use updater::{PartialBlocks, UpdateResult, Updater};

use crate::block::{BlockId, ParquetConverterMark};
use crate::bucket::{get_json, upload_json, Bucket};
use crate::{Error, Result};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

pub const INDEX_COMPRESSED_FILENAME: &str = "bucket-index.json.gz";
pub const SYNC_STATUS_FILENAME: &str = "bucket-index-sync-status.json";
pub const INDEX_VERSION: u32 = 1;
pub const SYNC_STATUS_VERSION: u32 = 1;

/// A live block as recorded in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBlock {
    pub id: BlockId,
    /// Millis since epoch
    pub min_time: i64,
    /// Millis since epoch
    pub max_time: i64,
    /// Present once the block has been converted to parquet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parquet: Option<ParquetConverterMark>,
}

/// A block deletion mark as recorded in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDeletionMark {
    pub id: BlockId,
    /// Unix seconds the mark was created
    pub deletion_time: i64,
}

/// The per-tenant manifest. Blocks and marks are kept ordered by id so two
/// rebuilds from identical bucket truth are byte-identical modulo
/// `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    /// Unix seconds of the last rebuild
    pub updated_at: i64,
    pub blocks: Vec<IndexBlock>,
    pub block_deletion_marks: Vec<IndexDeletionMark>,
}

impl Index {
    pub fn new(updated_at: i64) -> Self {
        Self {
            version: INDEX_VERSION,
            updated_at,
            blocks: Vec::new(),
            block_deletion_marks: Vec::new(),
        }
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    pub fn mark_ids(&self) -> Vec<BlockId> {
        self.block_deletion_marks.iter().map(|m| m.id).collect()
    }

    pub fn is_marked_for_deletion(&self, id: BlockId) -> bool {
        self.block_deletion_marks.iter().any(|m| m.id == id)
    }

    pub fn remove_block(&mut self, id: BlockId) {
        self.blocks.retain(|b| b.id != id);
        self.block_deletion_marks.retain(|m| m.id != id);
    }
}

/// Health of the last index sync, surfaced to queriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatusKind {
    Ok,
    CustomerManagedKeyError,
    Unknown,
}

/// Written alongside the index; a non-`Ok` status quarantines the tenant
/// from queries until `non_queryable_until` passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncStatusKind,
    /// Millis since epoch; 0 when the tenant was never quarantined
    pub non_queryable_until: i64,
    pub version: u32,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            status: SyncStatusKind::Unknown,
            non_queryable_until: 0,
            version: SYNC_STATUS_VERSION,
        }
    }
}

/// Reads and decompresses the tenant's index.
///
/// A missing or unparseable index is reported as [`Error::IndexNotFound`]:
/// the index is derived data, the cleaner rebuilds it on its next pass.
pub async fn read_index(bucket: &dyn Bucket) -> Result<Index> {
    let compressed = match bucket.get(INDEX_COMPRESSED_FILENAME).await {
        Ok(bytes) => bytes,
        Err(Error::NotFound { .. }) => return Err(Error::IndexNotFound),
        Err(e) => return Err(e),
    };

    let mut decoder = GzDecoder::new(compressed.as_ref());
    let mut json = Vec::new();
    if let Err(e) = decoder.read_to_end(&mut json) {
        warn!(error = %e, "bucket index is not valid gzip, treating as not found");
        return Err(Error::IndexNotFound);
    }

    match serde_json::from_slice(&json) {
        Ok(index) => Ok(index),
        Err(e) => {
            warn!(error = %e, "bucket index is corrupted, treating as not found");
            Err(Error::IndexNotFound)
        }
    }
}

/// Compresses and atomically writes the tenant's index.
pub async fn write_index(bucket: &dyn Bucket, index: &Index) -> Result<()> {
    let json = serde_json::to_vec(index)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    bucket
        .upload(INDEX_COMPRESSED_FILENAME, Bytes::from(compressed))
        .await
}

pub async fn delete_index(bucket: &dyn Bucket) -> Result<()> {
    bucket.delete(INDEX_COMPRESSED_FILENAME).await
}

/// Reads the sync status; absent or corrupt becomes the Unknown default.
pub async fn read_sync_status(bucket: &dyn Bucket) -> Result<SyncStatus> {
    match get_json(bucket, SYNC_STATUS_FILENAME).await {
        Ok(status) => Ok(status),
        Err(Error::NotFound { .. }) | Err(Error::Serialization(_)) => Ok(SyncStatus::default()),
        Err(e) => Err(e),
    }
}

pub async fn write_sync_status(bucket: &dyn Bucket, status: &SyncStatus) -> Result<()> {
    upload_json(bucket, SYNC_STATUS_FILENAME, status).await
}

pub async fn delete_sync_status(bucket: &dyn Bucket) -> Result<()> {
    bucket.delete(SYNC_STATUS_FILENAME).await
}
