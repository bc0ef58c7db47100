//! Block identities, marker objects, and the per-tenant key layout
//!
//! A block is an immutable directory of TSDB files keyed by a ULID, which
//! sorts lexicographically by creation time:
//!
//! ```text
//! <tenant>/<block-id>/meta.json
//! <tenant>/<block-id>/index
//! <tenant>/<block-id>/chunks/<n>
//! <tenant>/<block-id>/deletion-mark.json
//! <tenant>/<block-id>/no-compact-mark.json
//! <tenant>/<block-id>/visit-mark.json
//! <tenant>/<block-id>/parquet-converter-mark.json
//! <tenant>/markers/<block-id>-deletion-mark.json
//! <tenant>/tenant-deletion-mark.json
//! <tenant>/debug/metas/meta.json
//! ```
//!
//! All paths in this module are relative to the tenant scope.

use crate::bucket::{get_json, upload_json, Bucket};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// 16-byte time-ordered block identifier.
pub type BlockId = Ulid;

pub const META_FILENAME: &str = "meta.json";
pub const INDEX_FILENAME: &str = "index";
pub const DELETION_MARK_FILENAME: &str = "deletion-mark.json";
pub const NO_COMPACT_MARK_FILENAME: &str = "no-compact-mark.json";
pub const BLOCK_VISIT_MARKER_FILENAME: &str = "visit-mark.json";
pub const PARQUET_CONVERTER_MARK_FILENAME: &str = "parquet-converter-mark.json";
pub const TENANT_DELETION_MARK_FILENAME: &str = "tenant-deletion-mark.json";
pub const MARKERS_DIR: &str = "markers";
pub const DEBUG_METAS_DIR: &str = "debug/metas";

pub const DELETION_MARK_VERSION: u32 = 1;
pub const NO_COMPACT_MARK_VERSION: u32 = 1;
pub const PARQUET_CONVERTER_MARK_VERSION: u32 = 1;

/// Block metadata, uploaded last by the external writer. A block directory
/// without a meta file is *partial*: either mid-upload or partially deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    /// Minimum sample timestamp, millis since epoch
    pub min_time: i64,
    /// Maximum sample timestamp, millis since epoch
    pub max_time: i64,
    #[serde(default)]
    pub version: u32,
    /// Source labels attached by the shipper
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

pub fn meta_path(block: BlockId) -> String {
    format!("{block}/{META_FILENAME}")
}

pub fn deletion_mark_path(block: BlockId) -> String {
    format!("{block}/{DELETION_MARK_FILENAME}")
}

pub fn global_deletion_mark_path(block: BlockId) -> String {
    format!("{MARKERS_DIR}/{block}-{DELETION_MARK_FILENAME}")
}

pub fn no_compact_mark_path(block: BlockId) -> String {
    format!("{block}/{NO_COMPACT_MARK_FILENAME}")
}

pub fn parquet_converter_mark_path(block: BlockId) -> String {
    format!("{block}/{PARQUET_CONVERTER_MARK_FILENAME}")
}

/// Parses `markers/<block-id>-deletion-mark.json` back into a block id.
pub fn parse_global_deletion_mark(key: &str) -> Option<BlockId> {
    key.strip_prefix(MARKERS_DIR)?
        .strip_prefix('/')?
        .strip_suffix(DELETION_MARK_FILENAME)?
        .strip_suffix('-')?
        .parse()
        .ok()
}

/// Splits a tenant-relative key into its block id and the in-block remainder.
pub fn parse_block_key(key: &str) -> Option<(BlockId, &str)> {
    let (dir, rest) = key.split_once('/')?;
    let id: BlockId = dir.parse().ok()?;
    Some((id, rest))
}

/// Why a block was marked for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionReason {
    /// The block aged out of the tenant's retention period
    Retention,
    /// The block was compacted into a fresh block
    Compaction,
    /// An operator requested the deletion
    Manual,
}

/// Tombstone declaring intent to delete a block. Physical deletion is
/// deferred by the deletion delay so racing readers can finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub block_id: BlockId,
    pub version: u32,
    /// Unix seconds, stamped by the marking instance's clock
    pub creation_time: i64,
    pub reason: DeletionReason,
}

impl DeletionMark {
    pub fn new(block_id: BlockId, creation_time: i64, reason: DeletionReason) -> Self {
        Self {
            block_id,
            version: DELETION_MARK_VERSION,
            creation_time,
            reason,
        }
    }
}

/// Excludes a block from compaction grouping without deleting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoCompactMark {
    pub block_id: BlockId,
    pub version: u32,
    pub no_compact_time: i64,
    #[serde(default)]
    pub reason: String,
}

/// Written into a block directory once its parquet conversion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetConverterMark {
    pub version: u32,
}

/// Tenant-level tombstone written by an admin action. Cleanup is two-phased:
/// block data goes first, everything else only after `finished_time` has
/// aged past the tenant cleanup delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDeletionMark {
    /// Unix seconds of the deletion request
    pub request_time: i64,
    /// Unix seconds when all blocks were confirmed deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<i64>,
}

impl TenantDeletionMark {
    pub fn new(request_time: i64) -> Self {
        Self {
            request_time,
            finished_time: None,
        }
    }
}

/// Reads the tenant deletion mark from a tenant-scoped bucket.
pub async fn read_tenant_deletion_mark(bucket: &dyn Bucket) -> Result<Option<TenantDeletionMark>> {
    match get_json(bucket, TENANT_DELETION_MARK_FILENAME).await {
        Ok(mark) => Ok(Some(mark)),
        Err(Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writes the tenant deletion mark to a tenant-scoped bucket.
pub async fn write_tenant_deletion_mark(
    bucket: &dyn Bucket,
    mark: &TenantDeletionMark,
) -> Result<()> {
    upload_json(bucket, TENANT_DELETION_MARK_FILENAME, mark).await
}
