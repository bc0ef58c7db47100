//! Partitioned compaction planner
//!
//! Groups compactible blocks within aligned time ranges into *partitioned
//! groups*, each split into partitions of disjoint block subsets. A
//! partition is handed to whichever compactor instance first captures its
//! visit marker; completed groups are garbage-collected by the cleaner.

use crate::block::BlockId;
use crate::bucket::{get_json, upload_json, Bucket};
use crate::bucketindex::{Index, IndexBlock};
use crate::clock::BoundedClock;
use crate::ring::hash_block_id;
use crate::visit::{read_marker, VisitMarker, VisitMarkerManager, VisitStatus, VISIT_MARKER_VERSION};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const PARTITIONED_GROUPS_DIR: &str = "partitioned-groups";
pub const PARTITION_VISIT_MARKS_DIR: &str = "partitioned-groups/visit-marks";
pub const PARTITIONED_GROUP_INFO_VERSION: u32 = 1;

pub fn partitioned_group_file(group_id: u32) -> String {
    format!("{PARTITIONED_GROUPS_DIR}/{group_id}.json")
}

pub fn partition_visit_marker_path(group_id: u32, partition_id: u32) -> String {
    format!("{PARTITION_VISIT_MARKS_DIR}/{group_id}/{partition_id}.json")
}

/// One partition: an immutable, disjoint subset of the group's blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub partition_id: u32,
    pub blocks: Vec<BlockId>,
}

/// Descriptor of a partitioned compaction group, written once by the
/// planner and deleted when every partition completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedGroupInfo {
    pub partitioned_group_id: u32,
    pub partition_count: u32,
    pub partitions: Vec<Partition>,
    /// Millis since epoch
    pub range_start: i64,
    /// Millis since epoch
    pub range_end: i64,
    /// Unix seconds
    pub creation_time: i64,
    pub version: u32,
}

impl PartitionedGroupInfo {
    pub fn file_path(&self) -> String {
        partitioned_group_file(self.partitioned_group_id)
    }

    pub fn all_blocks(&self) -> BTreeSet<BlockId> {
        self.partitions
            .iter()
            .flat_map(|p| p.blocks.iter().copied())
            .collect()
    }
}

/// Visit marker serializing partition execution across the compactor fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionVisitMarker {
    pub partitioned_group_id: u32,
    pub partition_id: u32,
    #[serde(default)]
    pub owner: String,
    pub status: VisitStatus,
    /// Unix seconds
    pub visit_time: i64,
    pub version: u32,
}

impl PartitionVisitMarker {
    pub fn new(partitioned_group_id: u32, partition_id: u32) -> Self {
        Self {
            partitioned_group_id,
            partition_id,
            owner: String::new(),
            status: VisitStatus::Pending,
            visit_time: 0,
            version: VISIT_MARKER_VERSION,
        }
    }
}

impl VisitMarker for PartitionVisitMarker {
    fn marker_path(&self) -> String {
        partition_visit_marker_path(self.partitioned_group_id, self.partition_id)
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn visit_time(&self) -> i64 {
        self.visit_time
    }

    fn status(&self) -> VisitStatus {
        self.status
    }

    fn renew(&mut self, owner: &str, now: i64, status: VisitStatus) {
        self.owner = owner.to_string();
        self.visit_time = now;
        self.status = status;
    }
}

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Deterministic group id: hash of tenant, range bounds, and the sorted
/// input block set, so re-planning identical inputs converges on the same
/// group file.
pub fn compute_group_id(user: &str, range_start: i64, range_end: i64, blocks: &BTreeSet<BlockId>) -> u32 {
    let mut hash = FNV32_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(FNV32_PRIME);
        }
    };
    feed(user.as_bytes());
    feed(&range_start.to_be_bytes());
    feed(&range_end.to_be_bytes());
    for block in blocks {
        feed(&block.to_bytes());
    }
    hash
}

/// Deterministically assigns blocks to partitions by hashing block ids
/// modulo the partition count. Every observer of the same input block set
/// computes the same disjoint partitions.
pub fn assign_partitions(blocks: &BTreeSet<BlockId>, partition_count: u32) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = (0..partition_count)
        .map(|partition_id| Partition {
            partition_id,
            blocks: Vec::new(),
        })
        .collect();
    for block in blocks {
        let slot = hash_block_id(*block) % partition_count;
        partitions[slot as usize].blocks.push(*block);
    }
    partitions
}

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Ordered compaction range widths in millis; defines candidate group
    /// boundaries
    pub block_ranges: Vec<i64>,
    /// Upper bound of blocks per partition; drives the partition count
    pub max_blocks_per_partition: usize,
    /// Lease after which an in-progress partition is reclaimable
    pub visit_marker_timeout: Duration,
    /// How often a worker refreshes its partition visit marker
    pub visit_marker_update_interval: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            block_ranges: vec![
                2 * 3_600_000,  // 2h
                12 * 3_600_000, // 12h
                24 * 3_600_000, // 24h
            ],
            max_blocks_per_partition: 4,
            visit_marker_timeout: Duration::from_secs(300),
            visit_marker_update_interval: Duration::from_secs(60),
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_ranges.is_empty() {
            return Err(Error::Config("block-ranges must not be empty".to_string()));
        }
        if self.block_ranges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "block-ranges must be strictly ascending".to_string(),
            ));
        }
        if self.block_ranges.iter().any(|r| *r <= 0) {
            return Err(Error::Config("block-ranges must be positive".to_string()));
        }
        if self.max_blocks_per_partition == 0 {
            return Err(Error::Config(
                "max-blocks-per-partition must be greater than 0".to_string(),
            ));
        }
        if self.visit_marker_update_interval > self.visit_marker_timeout {
            return Err(Error::Config(
                "visit-marker-file-update-interval must not exceed visit-marker-timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// A candidate group before it gets an id and partitions.
#[derive(Debug, PartialEq)]
struct RangeGroup {
    range_start: i64,
    range_end: i64,
    blocks: BTreeSet<BlockId>,
}

/// Buckets compactible blocks into aligned `[k·r, (k+1)·r)` windows per
/// configured range, smallest range first. A window needs at least two
/// blocks; a block spanning its whole window is an output of that range and
/// is not regrouped there. Blocks consumed at a smaller range are excluded
/// from larger ones within the same planning round.
fn group_blocks_by_range(blocks: &[IndexBlock], excluded: &HashSet<BlockId>, ranges: &[i64]) -> Vec<RangeGroup> {
    let mut groups: Vec<RangeGroup> = Vec::new();
    let mut consumed: HashSet<BlockId> = HashSet::new();

    for &range in ranges {
        let mut windows: std::collections::BTreeMap<i64, BTreeSet<BlockId>> =
            std::collections::BTreeMap::new();
        for block in blocks {
            if excluded.contains(&block.id) || consumed.contains(&block.id) {
                continue;
            }
            let window_start = (block.min_time / range) * range;
            let window_end = window_start + range;
            if block.max_time > window_end {
                // Crosses the window boundary; a larger range may fit it.
                continue;
            }
            if block.max_time - block.min_time >= range {
                continue;
            }
            windows.entry(window_start).or_default().insert(block.id);
        }

        for (window_start, ids) in windows {
            if ids.len() < 2 {
                continue;
            }
            consumed.extend(ids.iter().copied());
            groups.push(RangeGroup {
                range_start: window_start,
                range_end: window_start + range,
                blocks: ids,
            });
        }
    }
    groups
}

/// Aggregate view of a group's partition markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupStatus {
    pub pending: u32,
    pub in_progress: u32,
    pub expired_in_progress: u32,
    pub completed: u32,
    pub failed: u32,
}

impl GroupStatus {
    pub fn all_completed(&self, partition_count: u32) -> bool {
        self.completed == partition_count
    }

    /// Partitions still waiting for a worker: pending, failed, and expired
    /// in-progress all get retried.
    pub fn remaining(&self) -> u32 {
        self.pending + self.expired_in_progress + self.failed
    }
}

/// Reads every partition marker of a group. Absent markers count as pending.
pub async fn group_status(
    bucket: &dyn Bucket,
    info: &PartitionedGroupInfo,
    now: i64,
    lease: Duration,
) -> Result<GroupStatus> {
    let mut status = GroupStatus::default();
    for partition in &info.partitions {
        let path = partition_visit_marker_path(info.partitioned_group_id, partition.partition_id);
        let marker = read_marker::<PartitionVisitMarker>(bucket, &path).await?;
        match marker {
            None => status.pending += 1,
            Some(marker) => match marker.status {
                VisitStatus::Pending => status.pending += 1,
                VisitStatus::Completed => status.completed += 1,
                VisitStatus::Failed => status.failed += 1,
                VisitStatus::InProgress => {
                    if marker.is_expired(now, lease) {
                        status.expired_in_progress += 1;
                    } else {
                        status.in_progress += 1;
                    }
                }
            },
        }
    }
    Ok(status)
}

/// Reads a partitioned group descriptor.
pub async fn read_partitioned_group_info(
    bucket: &dyn Bucket,
    group_id: u32,
) -> Result<PartitionedGroupInfo> {
    get_json(bucket, &partitioned_group_file(group_id)).await
}

/// Writes a group descriptor unless one already exists — the descriptor is
/// immutable once written, so the first planner wins and every other
/// instance adopts its assignment.
pub async fn update_partitioned_group_info(
    bucket: &dyn Bucket,
    info: &PartitionedGroupInfo,
) -> Result<PartitionedGroupInfo> {
    match read_partitioned_group_info(bucket, info.partitioned_group_id).await {
        Ok(existing) => {
            debug!(
                group = info.partitioned_group_id,
                "partitioned group already planned, adopting existing descriptor"
            );
            Ok(existing)
        }
        Err(Error::NotFound { .. }) | Err(Error::Serialization(_)) => {
            upload_json(bucket, &info.file_path(), info).await?;
            Ok(info.clone())
        }
        Err(e) => Err(e),
    }
}

/// Lists the ids of every partitioned group file of a tenant.
pub async fn list_partitioned_group_ids(bucket: &dyn Bucket) -> Result<Vec<u32>> {
    let keys = bucket.list(PARTITIONED_GROUPS_DIR).await?;
    let mut ids = Vec::new();
    for key in keys {
        let Some(name) = key.strip_prefix(&format!("{PARTITIONED_GROUPS_DIR}/")) else {
            continue;
        };
        // Skip the visit-marks subtree.
        let Some(id) = name.strip_suffix(".json").filter(|n| !n.contains('/')) else {
            continue;
        };
        if let Ok(id) = id.parse() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Plans partitioned groups for one tenant.
pub struct Planner {
    bucket: Arc<dyn Bucket>,
    user_id: String,
    cfg: PlannerConfig,
    clock: Arc<BoundedClock>,
}

impl Planner {
    /// `bucket` must be scoped to the tenant.
    pub fn new(
        bucket: Arc<dyn Bucket>,
        user_id: &str,
        cfg: PlannerConfig,
        clock: Arc<BoundedClock>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            bucket,
            user_id: user_id.to_string(),
            cfg,
            clock,
        })
    }

    /// Proposes partitioned groups from the current index and persists any
    /// that are new. Blocks already deletion-marked or no-compact-marked are
    /// not compactible.
    pub async fn plan(
        &self,
        index: &Index,
        no_compact: &HashSet<BlockId>,
    ) -> Result<Vec<PartitionedGroupInfo>> {
        let mut excluded: HashSet<BlockId> = index.mark_ids().into_iter().collect();
        excluded.extend(no_compact.iter().copied());

        let candidates = group_blocks_by_range(&index.blocks, &excluded, &self.cfg.block_ranges);
        let mut planned = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let group_id = compute_group_id(
                &self.user_id,
                candidate.range_start,
                candidate.range_end,
                &candidate.blocks,
            );
            let partition_count = candidate
                .blocks
                .len()
                .div_ceil(self.cfg.max_blocks_per_partition)
                .max(1) as u32;
            let info = PartitionedGroupInfo {
                partitioned_group_id: group_id,
                partition_count,
                partitions: assign_partitions(&candidate.blocks, partition_count),
                range_start: candidate.range_start,
                range_end: candidate.range_end,
                creation_time: self.clock.now_secs(),
                version: PARTITIONED_GROUP_INFO_VERSION,
            };

            let adopted = update_partitioned_group_info(self.bucket.as_ref(), &info).await?;
            if adopted.creation_time == info.creation_time {
                info!(
                    user = %self.user_id,
                    group = group_id,
                    partitions = partition_count,
                    blocks = candidate.blocks.len(),
                    range_start = candidate.range_start,
                    range_end = candidate.range_end,
                    "planned partitioned compaction group"
                );
            }
            planned.push(adopted);
        }
        Ok(planned)
    }

    /// Builds the visit-marker manager a worker uses to claim and hold one
    /// partition.
    pub fn partition_visit_manager(
        &self,
        group_id: u32,
        partition_id: u32,
        owner: &str,
    ) -> VisitMarkerManager<PartitionVisitMarker> {
        VisitMarkerManager::new(
            Arc::clone(&self.bucket),
            owner,
            Arc::clone(&self.clock),
            PartitionVisitMarker::new(group_id, partition_id),
        )
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.cfg
    }
}
