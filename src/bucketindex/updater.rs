//! Rebuilds the bucket index from bucket truth

use super::{Index, IndexBlock, IndexDeletionMark};
use crate::block::{
    global_deletion_mark_path, meta_path, parquet_converter_mark_path, parse_block_key,
    parse_global_deletion_mark, BlockId, BlockMeta, DeletionMark, ParquetConverterMark,
    META_FILENAME, NO_COMPACT_MARK_FILENAME, PARQUET_CONVERTER_MARK_FILENAME,
};
use crate::bucket::{get_json, Bucket};
use crate::{Error, Result};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Partial blocks found during an update: block id → files present in the
/// block directory (no meta among them).
pub type PartialBlocks = BTreeMap<BlockId, Vec<String>>;

/// Outcome of one index rebuild.
pub struct UpdateResult {
    pub index: Index,
    pub partials: PartialBlocks,
    /// Blocks carrying a no-compact mark
    pub no_compact_blocks: usize,
}

#[derive(Default)]
struct BlockFiles {
    has_meta: bool,
    files: Vec<String>,
}

/// Rebuilds a tenant's index from a single listing of the tenant prefix.
///
/// The updater is invoked only by the cleaner; any pre-existing index object
/// is ignored, so a corrupted index heals on the next pass without a
/// quarantine.
pub struct Updater {
    bucket: Arc<dyn Bucket>,
}

impl Updater {
    /// `bucket` must be scoped to the tenant.
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket }
    }

    pub async fn update_index(&self, now: i64) -> Result<UpdateResult> {
        let keys = self.bucket.list("").await?;

        let mut blocks: BTreeMap<BlockId, BlockFiles> = BTreeMap::new();
        let mut mark_ids: Vec<BlockId> = Vec::new();

        for key in &keys {
            if let Some(id) = parse_global_deletion_mark(key) {
                mark_ids.push(id);
                continue;
            }
            if let Some((id, file)) = parse_block_key(key) {
                let entry = blocks.entry(id).or_default();
                if file == META_FILENAME {
                    entry.has_meta = true;
                }
                entry.files.push(file.to_string());
            }
            // Everything else (index objects, tenant mark, partitioned
            // groups, debug metas) is not block state.
        }

        let mut index = Index::new(now);
        let mut partials = PartialBlocks::new();
        let mut no_compact_blocks = 0;

        for (id, found) in blocks {
            if !found.has_meta {
                partials.insert(id, found.files);
                continue;
            }
            if found.files.iter().any(|f| f == NO_COMPACT_MARK_FILENAME) {
                no_compact_blocks += 1;
            }

            let meta: BlockMeta = match get_json(self.bucket.as_ref(), &meta_path(id)).await {
                Ok(meta) => meta,
                Err(Error::NotFound { .. }) => {
                    // Deleted between the listing and the read.
                    debug!(block = %id, "block meta disappeared during index update");
                    continue;
                }
                Err(Error::Serialization(e)) => {
                    warn!(block = %id, error = %e, "unparseable block meta, leaving block out of the index");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let parquet = if found
                .files
                .iter()
                .any(|f| f == PARQUET_CONVERTER_MARK_FILENAME)
            {
                match get_json::<ParquetConverterMark>(
                    self.bucket.as_ref(),
                    &parquet_converter_mark_path(id),
                )
                .await
                {
                    Ok(mark) => Some(mark),
                    Err(Error::NotFound { .. }) => None,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            index.blocks.push(IndexBlock {
                id,
                min_time: meta.min_time,
                max_time: meta.max_time,
                parquet,
            });
        }

        mark_ids.sort_unstable();
        mark_ids.dedup();
        for id in mark_ids {
            match get_json::<DeletionMark>(self.bucket.as_ref(), &global_deletion_mark_path(id))
                .await
            {
                Ok(mark) => index.block_deletion_marks.push(IndexDeletionMark {
                    id,
                    deletion_time: mark.creation_time,
                }),
                Err(Error::NotFound { .. }) => continue,
                Err(Error::Serialization(e)) => {
                    warn!(block = %id, error = %e, "unparseable deletion mark, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(UpdateResult {
            index,
            partials,
            no_compact_blocks,
        })
    }
}
