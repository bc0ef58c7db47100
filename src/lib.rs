//! # Basalt
//!
//! A horizontally-scalable, multi-tenant block lifecycle core for TSDB
//! blocks in object storage.
//!
//! Basalt owns the blocks of an object bucket from the moment ingesters
//! ship them, through retention enforcement and partitioned compaction
//! planning, to safe deletion — coordinated across a sharded fleet of
//! instances that join and leave a consistent hash ring.
//!
//! ## Key Ideas
//!
//! - **Bucket as ground truth**: every index, marker, and descriptor is
//!   derived data, rebuilt from a bucket that offers only per-object
//!   atomicity
//! - **Advisory leases, no locks**: visit markers with lease expiry give
//!   at-most-one-worker semantics per tenant cleanup and per compaction
//!   partition; crash recovery is O(lease)
//! - **Tokenized ownership**: a consistent hash ring with 32-bit tokens,
//!   heartbeats, and auto-forget decides which instance works on which
//!   tenant
//!
//! ## Architecture
//!
//! - **Cleaner**: rebuilds per-tenant bucket indexes, applies retention,
//!   enforces deletion delays, tombstones tenants
//! - **Planner**: groups compactible blocks into partitioned groups handed
//!   to whichever compactor captures the partition visit marker
//! - **Limiter**: sheds query-serving load when CPU or heap utilization
//!   crosses configured thresholds

pub mod block;
pub mod bucket;
pub mod bucketindex;
pub mod cleaner;
pub mod clock;
pub mod limiter;
pub mod metrics;
pub mod planner;
pub mod ring;
pub mod users;
pub mod visit;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::block::{BlockId, BlockMeta, DeletionMark, DeletionReason, TenantDeletionMark};
    pub use crate::bucket::{Bucket, GlobalMarkersBucket, ObjectStoreBucket, UserBucket};
    pub use crate::bucketindex::{Index, SyncStatus, SyncStatusKind};
    pub use crate::cleaner::{BlocksCleaner, CleanerConfig, ConfigProvider};
    pub use crate::limiter::{ResourceBasedLimiter, ResourceMonitor, ResourceType};
    pub use crate::planner::{PartitionedGroupInfo, Planner, PlannerConfig};
    pub use crate::ring::{InstanceState, Lifecycler, Ring, RingConfig};
    pub use crate::users::{ListScanner, ShardedScanner, UsersScanner};
    pub use crate::{Error, Result};
}
