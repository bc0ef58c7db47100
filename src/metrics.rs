//! Prometheus metrics for the block lifecycle core
//!
//! Metrics are registered against an explicit registry handed in at
//! component construction — never an ambient global. Per-tenant gauge
//! families support removal so series for tenants that left the local
//! shard do not linger.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

/// Per-tenant label set.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UserLabels {
    pub user: String,
}

impl UserLabels {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }
}

/// Per-tenant label set with a deletion reason.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UserReasonLabels {
    pub user: String,
    pub reason: String,
}

/// Tenant-status label set (active vs deleted) for run counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: String,
}

pub const ACTIVE_STATUS: &str = "active";
pub const DELETED_STATUS: &str = "deleted";

impl StatusLabels {
    pub fn active() -> Self {
        Self {
            status: ACTIVE_STATUS.to_string(),
        }
    }

    pub fn deleted() -> Self {
        Self {
            status: DELETED_STATUS.to_string(),
        }
    }
}

/// Container for all blocks-cleaner metrics.
pub struct CleanerMetrics {
    /// Cleanup runs started, by tenant status.
    pub runs_started: Family<StatusLabels, Counter>,
    /// Cleanup runs completed successfully, by tenant status.
    pub runs_completed: Family<StatusLabels, Counter>,
    /// Cleanup runs failed, by tenant status.
    pub runs_failed: Family<StatusLabels, Counter>,
    /// Duration of the last cleanup pass in seconds.
    pub run_duration_seconds: Gauge<f64, AtomicU64>,
    /// Blocks physically deleted.
    pub blocks_cleaned: Counter,
    /// Block deletion failures.
    pub block_cleanup_failures: Counter,
    /// Blocks marked for deletion, by tenant and reason.
    pub blocks_marked_for_deletion: Family<UserReasonLabels, Counter>,

    /// Blocks in the bucket, including marked-for-deletion, excluding partials.
    pub tenant_blocks: Family<UserLabels, Gauge>,
    /// Blocks marked for deletion in the bucket.
    pub tenant_blocks_marked_for_deletion: Family<UserLabels, Gauge>,
    /// Partial blocks (no meta file).
    pub tenant_blocks_partials: Family<UserLabels, Gauge>,
    /// Blocks marked to not be compacted.
    pub tenant_blocks_no_compact: Family<UserLabels, Gauge>,
    /// Parquet-converted blocks, including marked-for-deletion.
    pub tenant_parquet_blocks: Family<UserLabels, Gauge>,
    /// Blocks still awaiting parquet conversion, including marked-for-deletion.
    pub tenant_parquet_unconverted_blocks: Family<UserLabels, Gauge>,
}

impl CleanerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let runs_started = Family::<StatusLabels, Counter>::default();
        registry.register(
            "blocks_cleaner_runs_started",
            "Total number of blocks cleanup runs started",
            runs_started.clone(),
        );

        let runs_completed = Family::<StatusLabels, Counter>::default();
        registry.register(
            "blocks_cleaner_runs_completed",
            "Total number of blocks cleanup runs successfully completed",
            runs_completed.clone(),
        );

        let runs_failed = Family::<StatusLabels, Counter>::default();
        registry.register(
            "blocks_cleaner_runs_failed",
            "Total number of blocks cleanup runs failed",
            runs_failed.clone(),
        );

        let run_duration_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "blocks_cleaner_run_duration_seconds",
            "Duration of the last blocks cleanup run in seconds",
            run_duration_seconds.clone(),
        );

        let blocks_cleaned = Counter::default();
        registry.register(
            "blocks_cleaner_blocks_cleaned",
            "Total number of blocks deleted",
            blocks_cleaned.clone(),
        );

        let block_cleanup_failures = Counter::default();
        registry.register(
            "blocks_cleaner_block_cleanup_failures",
            "Total number of blocks failed to be deleted",
            block_cleanup_failures.clone(),
        );

        let blocks_marked_for_deletion = Family::<UserReasonLabels, Counter>::default();
        registry.register(
            "blocks_marked_for_deletion",
            "Total number of blocks marked for deletion",
            blocks_marked_for_deletion.clone(),
        );

        let tenant_blocks = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_blocks_count",
            "Total number of blocks in the bucket. Includes blocks marked for deletion, but not partial blocks",
            tenant_blocks.clone(),
        );

        let tenant_blocks_marked_for_deletion = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_blocks_marked_for_deletion_count",
            "Total number of blocks marked for deletion in the bucket",
            tenant_blocks_marked_for_deletion.clone(),
        );

        let tenant_blocks_partials = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_blocks_partials_count",
            "Total number of partial blocks",
            tenant_blocks_partials.clone(),
        );

        let tenant_blocks_no_compact = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_blocks_marked_for_no_compaction_count",
            "Total number of blocks marked for no compaction in the bucket",
            tenant_blocks_no_compact.clone(),
        );

        let tenant_parquet_blocks = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_parquet_blocks_count",
            "Total number of parquet blocks in the bucket. Blocks marked for deletion are included",
            tenant_parquet_blocks.clone(),
        );

        let tenant_parquet_unconverted_blocks = Family::<UserLabels, Gauge>::default();
        registry.register(
            "bucket_parquet_unconverted_blocks_count",
            "Total number of unconverted parquet blocks in the bucket. Blocks marked for deletion are included",
            tenant_parquet_unconverted_blocks.clone(),
        );

        Self {
            runs_started,
            runs_completed,
            runs_failed,
            run_duration_seconds,
            blocks_cleaned,
            block_cleanup_failures,
            blocks_marked_for_deletion,
            tenant_blocks,
            tenant_blocks_marked_for_deletion,
            tenant_blocks_partials,
            tenant_blocks_no_compact,
            tenant_parquet_blocks,
            tenant_parquet_unconverted_blocks,
        }
    }

    /// Drops every per-tenant gauge series for a tenant that is no longer
    /// owned by the local shard.
    pub fn delete_user_series(&self, user: &str) {
        let labels = UserLabels::new(user);
        self.tenant_blocks.remove(&labels);
        self.tenant_blocks_marked_for_deletion.remove(&labels);
        self.tenant_blocks_partials.remove(&labels);
        self.tenant_blocks_no_compact.remove(&labels);
        self.tenant_parquet_blocks.remove(&labels);
        self.tenant_parquet_unconverted_blocks.remove(&labels);
    }
}

/// Container for partitioned-compaction planner metrics.
pub struct PlannerMetrics {
    /// Partitions still waiting for a worker: pending plus expired in-progress.
    pub remaining_planned_partitions: Family<UserLabels, Gauge>,
    /// Partitions currently held by a worker with an unexpired lease.
    pub in_progress_partitions: Family<UserLabels, Gauge>,
    /// Seconds between now and the oldest partitioned group not yet completed.
    pub oldest_partition_group_offset: Family<UserLabels, Gauge>,
}

impl PlannerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let remaining_planned_partitions = Family::<UserLabels, Gauge>::default();
        registry.register(
            "compaction_remaining_planned_partitions",
            "Total number of partitions that remain to be compacted",
            remaining_planned_partitions.clone(),
        );

        let in_progress_partitions = Family::<UserLabels, Gauge>::default();
        registry.register(
            "compaction_in_progress_partitions",
            "Total number of partitions currently being compacted",
            in_progress_partitions.clone(),
        );

        let oldest_partition_group_offset = Family::<UserLabels, Gauge>::default();
        registry.register(
            "compaction_oldest_partition_group_offset_seconds",
            "Seconds between now and the creation of the oldest partitioned group not yet completed",
            oldest_partition_group_offset.clone(),
        );

        Self {
            remaining_planned_partitions,
            in_progress_partitions,
            oldest_partition_group_offset,
        }
    }

    pub fn delete_user_series(&self, user: &str) {
        let labels = UserLabels::new(user);
        self.remaining_planned_partitions.remove(&labels);
        self.in_progress_partitions.remove(&labels);
        self.oldest_partition_group_offset.remove(&labels);
    }
}
