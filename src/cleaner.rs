//! Blocks cleaner
//!
//! Periodic per-tenant state machine that reconciles the bucket index
//! against bucket truth, applies retention, enforces the deletion delay,
//! handles partial blocks, tombstones tenants, and garbage-collects
//! completed partitioned compaction groups. A per-tenant cleaner visit
//! marker serializes cleanup across instances; every step is idempotent so
//! a crashed pass resumes from bucket truth on the next interval.

use crate::block::{
    deletion_mark_path, global_deletion_mark_path, meta_path, no_compact_mark_path,
    parse_block_key, read_tenant_deletion_mark, write_tenant_deletion_mark, BlockId, DeletionMark,
    DeletionReason, BLOCK_VISIT_MARKER_FILENAME, DELETION_MARK_FILENAME,
    TENANT_DELETION_MARK_FILENAME,
};
use crate::bucket::{upload_json, Bucket, UserBucket};
use crate::bucketindex::{
    self, Index, IndexDeletionMark, SyncStatus, SyncStatusKind, UpdateResult, Updater,
    SYNC_STATUS_VERSION,
};
use crate::clock::BoundedClock;
use crate::metrics::{CleanerMetrics, PlannerMetrics, StatusLabels, UserLabels, UserReasonLabels};
use crate::planner::{
    group_status, list_partitioned_group_ids, partition_visit_marker_path, partitioned_group_file,
    read_partitioned_group_info,
};
use crate::users::UsersScanner;
use crate::visit::{VisitMarker, VisitMarkerManager, VisitStatus, VISIT_MARKER_VERSION};
use crate::{Error, Result};

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CLEANER_VISIT_MARKER_FILENAME: &str = "cleaner-visit-mark.json";

/// Visit marker serializing a tenant's cleanup across cleaner instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerVisitMarker {
    #[serde(default)]
    pub owner: String,
    pub visit_time: i64,
    pub status: VisitStatus,
    pub version: u32,
}

impl CleanerVisitMarker {
    pub fn new() -> Self {
        Self {
            owner: String::new(),
            visit_time: 0,
            status: VisitStatus::Pending,
            version: VISIT_MARKER_VERSION,
        }
    }
}

impl Default for CleanerVisitMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitMarker for CleanerVisitMarker {
    fn marker_path(&self) -> String {
        CLEANER_VISIT_MARKER_FILENAME.to_string()
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

/// Per-tenant overrides consulted on every pass.
pub trait ConfigProvider: Send + Sync + 'static {
    /// Retention for the tenant's blocks; zero disables retention.
    fn retention_period(&self, user: &str) -> Duration;

    /// Whether parquet-conversion accounting is enabled for the tenant.
    fn parquet_converter_enabled(&self, user: &str) -> bool;
}

/// Blocks cleaner configuration.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Minimum age of a deletion mark before the block is physically deleted
    pub deletion_delay: Duration,
    /// Cadence of the cleanup loop
    pub cleanup_interval: Duration,
    /// Tenants cleaned in parallel per pass
    pub cleanup_concurrency: usize,
    /// Minimum age of a tenant deletion mark's finished time before the
    /// final sweep removes debug files and the mark itself
    pub tenant_cleanup_delay: Duration,
    /// Ordered compaction range widths in millis; the smallest range is the
    /// minimum span a block must cover to be eligible for parquet conversion
    pub block_ranges: Vec<i64>,
    /// Copy legacy block-local deletion marks to the global location
    pub markers_migration_enabled: bool,
    /// Garbage-collect partitioned compaction groups
    pub partitioned_compaction_enabled: bool,
    /// Lease on the per-tenant cleaner visit marker
    pub cleaner_visit_marker_timeout: Duration,
    /// Lease on partition visit markers, for group GC decisions
    pub partition_visit_marker_timeout: Duration,
    /// How long a tenant stays non-queryable after an access-denied error
    pub sync_status_quarantine_ttl: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            deletion_delay: Duration::from_secs(12 * 3600),
            cleanup_interval: Duration::from_secs(15 * 60),
            cleanup_concurrency: 1,
            tenant_cleanup_delay: Duration::from_secs(6 * 3600),
            block_ranges: vec![2 * 3_600_000, 12 * 3_600_000, 24 * 3_600_000],
            markers_migration_enabled: false,
            partitioned_compaction_enabled: false,
            cleaner_visit_marker_timeout: Duration::from_secs(10 * 60),
            partition_visit_marker_timeout: Duration::from_secs(5 * 60),
            sync_status_quarantine_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl CleanerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_concurrency == 0 {
            return Err(Error::Config(
                "cleanup-concurrency must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::Config(
                "cleanup-interval must be greater than 0".to_string(),
            ));
        }
        if self.block_ranges.is_empty() {
            return Err(Error::Config("block-ranges must not be empty".to_string()));
        }
        if self.block_ranges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "block-ranges must be strictly ascending".to_string(),
            ));
        }
        Ok(())
    }
}

/// The blocks cleaner service.
pub struct BlocksCleaner {
    pub cfg: CleanerConfig,
    bucket: Arc<dyn Bucket>,
    users_scanner: Box<dyn UsersScanner>,
    cfg_provider: Arc<dyn ConfigProvider>,
    instance_id: String,
    clock: Arc<BoundedClock>,
    metrics: CleanerMetrics,
    partition_metrics: PlannerMetrics,
    shutdown: CancellationToken,
    /// Tenants owned on the previous pass, for gauge reconciliation
    last_owned_users: Mutex<HashSet<String>>,
}

impl BlocksCleaner {
    /// `bucket` must be the root bucket, already wrapped with the global
    /// deletion-mark mirroring decorator.
    pub fn new(
        cfg: CleanerConfig,
        bucket: Arc<dyn Bucket>,
        users_scanner: Box<dyn UsersScanner>,
        cfg_provider: Arc<dyn ConfigProvider>,
        instance_id: &str,
        registry: &mut Registry,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            bucket,
            users_scanner,
            cfg_provider,
            instance_id: instance_id.to_string(),
            clock: Arc::new(BoundedClock::default()),
            metrics: CleanerMetrics::new(registry),
            partition_metrics: PlannerMetrics::new(registry),
            shutdown: CancellationToken::new(),
            last_owned_users: Mutex::new(HashSet::new()),
        })
    }

    pub fn metrics(&self) -> &CleanerMetrics {
        &self.metrics
    }

    pub fn partition_metrics(&self) -> &PlannerMetrics {
        &self.partition_metrics
    }

    /// Replaces the users scanner, e.g. after resharding configuration.
    pub fn set_users_scanner(&mut self, scanner: Box<dyn UsersScanner>) {
        self.users_scanner = scanner;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the cleanup loop until the shutdown token is cancelled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.cfg.cleanup_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "blocks cleanup pass failed");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("blocks cleaner shutting down gracefully");
                    break;
                }
            }
        }
    }

    /// Runs a single cleanup pass over every owned tenant.
    pub async fn run_cycle(&self) -> Result<()> {
        let started = Instant::now();
        let (active, deleted) = self.scan_users().await?;
        info!(
            active = active.len(),
            deleted = deleted.len(),
            "starting blocks cleanup pass"
        );

        self.clean_active_users(&active).await;
        self.clean_deleted_users(&deleted).await;

        let owned: HashSet<String> = active.into_iter().chain(deleted).collect();
        self.reconcile_user_metrics(&owned);

        self.metrics
            .run_duration_seconds
            .set(started.elapsed().as_secs_f64());
        Ok(())
    }

    pub async fn scan_users(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.users_scanner.scan().await
    }

    /// Cleans active tenants with bounded concurrency. Per-tenant failures
    /// fail the pass counter but never abort the remaining tenants.
    pub async fn clean_active_users(&self, users: &[String]) {
        self.metrics
            .runs_started
            .get_or_create(&StatusLabels::active())
            .inc();

        let failures = stream::iter(users)
            .map(|user| async move {
                match self.clean_user(user).await {
                    Ok(()) => 0usize,
                    Err(e) => {
                        error!(user = %user, error = %e, "failed to clean up blocks for tenant");
                        1
                    }
                }
            })
            .buffer_unordered(self.cfg.cleanup_concurrency)
            .fold(0usize, |acc, n| async move { acc + n })
            .await;

        let label = StatusLabels::active();
        if failures == 0 {
            self.metrics.runs_completed.get_or_create(&label).inc();
        } else {
            self.metrics.runs_failed.get_or_create(&label).inc();
        }
    }

    /// Drives deletion-marked tenants toward full teardown.
    pub async fn clean_deleted_users(&self, users: &[String]) {
        self.metrics
            .runs_started
            .get_or_create(&StatusLabels::deleted())
            .inc();

        let failures = stream::iter(users)
            .map(|user| async move {
                match self.clean_deleted_user(user).await {
                    Ok(()) => 0usize,
                    Err(e) => {
                        error!(user = %user, error = %e, "failed to clean up deleted tenant");
                        1
                    }
                }
            })
            .buffer_unordered(self.cfg.cleanup_concurrency)
            .fold(0usize, |acc, n| async move { acc + n })
            .await;

        let label = StatusLabels::deleted();
        if failures == 0 {
            self.metrics.runs_completed.get_or_create(&label).inc();
        } else {
            self.metrics.runs_failed.get_or_create(&label).inc();
        }
    }

    /// Runs one tenant's cleanup under the cleaner visit marker.
    pub async fn clean_user(&self, user: &str) -> Result<()> {
        let user_bucket: Arc<dyn Bucket> =
            Arc::new(UserBucket::new(Arc::clone(&self.bucket), user));

        let visit = VisitMarkerManager::new(
            Arc::clone(&user_bucket),
            &self.instance_id,
            Arc::clone(&self.clock),
            CleanerVisitMarker::new(),
        );
        match visit.claim(self.cfg.cleaner_visit_marker_timeout).await {
            Ok(()) => {}
            Err(Error::MarkerHeld { owner }) => {
                debug!(user, owner = %owner, "tenant cleanup held by another cleaner, skipping");
                return Ok(());
            }
            Err(e) if e.is_access_denied() => {
                return self.quarantine_user(user_bucket.as_ref(), user).await;
            }
            Err(e) => return Err(e),
        }

        match self.clean_user_inner(&user_bucket, user).await {
            Ok(()) => {
                visit.complete().await?;
                Ok(())
            }
            Err(e) if e.is_access_denied() => {
                warn!(user, error = %e, "access denied during cleanup, quarantining tenant from queries");
                self.quarantine_user(user_bucket.as_ref(), user).await?;
                if let Err(e) = visit.complete().await {
                    debug!(user, error = %e, "failed to complete cleaner visit marker");
                }
                Ok(())
            }
            // The marker is left in place and reclaimed after lease expiry.
            Err(e) => Err(e),
        }
    }

    async fn clean_user_inner(&self, user_bucket: &Arc<dyn Bucket>, user: &str) -> Result<()> {
        // A readable-but-denied index must quarantine the tenant even though
        // the rebuild below never consumes the old object.
        match bucketindex::read_index(user_bucket.as_ref()).await {
            Ok(_) | Err(Error::IndexNotFound) => {}
            Err(e) => return Err(e),
        }

        if self.cfg.markers_migration_enabled {
            self.migrate_deletion_marks(user_bucket.as_ref(), user).await?;
        }

        let UpdateResult {
            mut index,
            partials,
            no_compact_blocks,
        } = Updater::new(Arc::clone(user_bucket))
            .update_index(self.clock.now_secs())
            .await?;

        self.delete_expired_marked_blocks(user_bucket.as_ref(), user, &mut index)
            .await?;

        let remaining_partials = self
            .clean_partial_blocks(user_bucket.as_ref(), user, &partials, &mut index)
            .await?;

        self.apply_retention(user_bucket.as_ref(), user, &mut index)
            .await?;

        if self.cfg.partitioned_compaction_enabled {
            self.clean_partitioned_group_info(user_bucket.as_ref(), user, &mut index)
                .await?;
            self.emit_user_partition_metrics(user_bucket.as_ref(), user)
                .await?;
        }

        // A tenant left with no blocks, marks, or partials is stale debris:
        // drop the derived objects and any leftovers instead of publishing
        // an empty index.
        if index.blocks.is_empty()
            && index.block_deletion_marks.is_empty()
            && remaining_partials == 0
        {
            self.delete_remaining_user_data(user_bucket.as_ref(), user).await?;
            return Ok(());
        }

        bucketindex::write_index(user_bucket.as_ref(), &index).await?;
        self.publish_sync_status(user_bucket.as_ref(), SyncStatusKind::Ok)
            .await?;

        self.update_user_metrics(user, &index, remaining_partials, no_compact_blocks);
        Ok(())
    }

    /// Physically deletes blocks whose deletion mark aged past the deletion
    /// delay. Failures are counted and skipped; the tenant pass continues.
    async fn delete_expired_marked_blocks(
        &self,
        user_bucket: &dyn Bucket,
        user: &str,
        index: &mut Index,
    ) -> Result<()> {
        let threshold = self.clock.now_secs() - self.cfg.deletion_delay.as_secs() as i64;
        let expired: Vec<BlockId> = index
            .block_deletion_marks
            .iter()
            .filter(|m| m.deletion_time <= threshold)
            .map(|m| m.id)
            .filter(|id| index.blocks.iter().any(|b| b.id == *id))
            .collect();

        for id in expired {
            match self.delete_block(user_bucket, id).await {
                Ok(()) => {
                    self.metrics.blocks_cleaned.inc();
                    index.remove_block(id);
                    info!(user, block = %id, "deleted block past its deletion delay");
                }
                Err(e) if e.is_access_denied() => return Err(e),
                Err(e) => {
                    warn!(user, block = %id, error = %e, "failed to delete block marked for deletion");
                    self.metrics.block_cleanup_failures.inc();
                }
            }
        }
        Ok(())
    }

    /// Partial-block policy: a partial with a deletion mark is deleted
    /// regardless of the mark's age (there is no readable block to protect);
    /// a partial whose only content is a stale visit marker is claim debris
    /// and is deleted; anything else may still be mid-upload and is left
    /// alone.
    ///
    /// Returns the partial count reported by this pass.
    async fn clean_partial_blocks(
        &self,
        user_bucket: &dyn Bucket,
        user: &str,
        partials: &bucketindex::PartialBlocks,
        index: &mut Index,
    ) -> Result<usize> {
        let marked: BTreeSet<BlockId> = index.mark_ids().into_iter().collect();
        let mut remaining = partials.len();

        for (id, files) in partials {
            if marked.contains(id) {
                match self.delete_block(user_bucket, *id).await {
                    Ok(()) => {
                        self.metrics.blocks_cleaned.inc();
                        index.block_deletion_marks.retain(|m| m.id != *id);
                        remaining -= 1;
                        info!(user, block = %id, "deleted partial block with deletion mark");
                    }
                    Err(e) if e.is_access_denied() => return Err(e),
                    Err(e) => {
                        warn!(user, block = %id, error = %e, "failed to delete partial block");
                        self.metrics.block_cleanup_failures.inc();
                    }
                }
                continue;
            }

            if files.len() == 1 && files[0] == BLOCK_VISIT_MARKER_FILENAME {
                match self.delete_block(user_bucket, *id).await {
                    Ok(()) => {
                        self.metrics.blocks_cleaned.inc();
                        info!(user, block = %id, "deleted partial block holding only a visit marker");
                    }
                    Err(e) if e.is_access_denied() => return Err(e),
                    Err(e) => {
                        warn!(user, block = %id, error = %e, "failed to delete visit-marker-only partial block");
                        self.metrics.block_cleanup_failures.inc();
                    }
                }
            }
        }
        Ok(remaining)
    }

    /// Marks blocks whose max time aged out of the tenant's retention
    /// period. Already-marked blocks are skipped to avoid churn and metric
    /// double counting.
    async fn apply_retention(
        &self,
        user_bucket: &dyn Bucket,
        user: &str,
        index: &mut Index,
    ) -> Result<()> {
        let retention = self.cfg_provider.retention_period(user);
        if retention.is_zero() {
            return Ok(());
        }

        let cutoff = self.clock.retention_cutoff_millis(retention);
        let outside: Vec<BlockId> = index
            .blocks
            .iter()
            .filter(|b| b.max_time < cutoff && !index.is_marked_for_deletion(b.id))
            .map(|b| b.id)
            .collect();

        for id in outside {
            let now = self.clock.now_secs();
            let mark = DeletionMark::new(id, now, DeletionReason::Retention);
            match upload_json(user_bucket, &deletion_mark_path(id), &mark).await {
                Ok(()) => {
                    index.block_deletion_marks.push(IndexDeletionMark {
                        id,
                        deletion_time: now,
                    });
                    self.metrics
                        .blocks_marked_for_deletion
                        .get_or_create(&UserReasonLabels {
                            user: user.to_string(),
                            reason: "retention".to_string(),
                        })
                        .inc();
                    info!(user, block = %id, "marked block for deletion by retention");
                }
                Err(e) if e.is_access_denied() => return Err(e),
                Err(e) => {
                    warn!(user, block = %id, error = %e, "failed to write retention deletion mark");
                }
            }
        }
        index.block_deletion_marks.sort_by_key(|m| m.id);
        Ok(())
    }

    /// Garbage-collects partitioned groups whose partitions all completed:
    /// their input blocks are obsolete (outputs live under fresh ids), so
    /// each still-existing input without a no-compact mark is marked for
    /// deletion, then the partition markers and the group file are removed.
    /// Groups with an unexpired in-progress partition are skipped; expired
    /// in-progress partitions count as pending and will be retried.
    async fn clean_partitioned_group_info(
        &self,
        user_bucket: &dyn Bucket,
        user: &str,
        index: &mut Index,
    ) -> Result<()> {
        let now = self.clock.now_secs();
        let lease = self.cfg.partition_visit_marker_timeout;

        for group_id in list_partitioned_group_ids(user_bucket).await? {
            let info = match read_partitioned_group_info(user_bucket, group_id).await {
                Ok(info) => info,
                Err(Error::NotFound { .. }) => continue,
                Err(Error::Serialization(e)) => {
                    warn!(user, group = group_id, error = %e, "deleting unparseable partitioned group file");
                    user_bucket.delete(&partitioned_group_file(group_id)).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = group_status(user_bucket, &info, now, lease).await?;
            if !status.all_completed(info.partition_count) {
                debug!(
                    user,
                    group = group_id,
                    remaining = status.remaining(),
                    in_progress = status.in_progress,
                    "partitioned group not completed yet"
                );
                continue;
            }

            for id in info.all_blocks() {
                if !user_bucket.exists(&meta_path(id)).await? {
                    continue;
                }
                if user_bucket.exists(&no_compact_mark_path(id)).await? {
                    continue;
                }
                if index.is_marked_for_deletion(id) {
                    continue;
                }
                let mark = DeletionMark::new(id, now, DeletionReason::Compaction);
                upload_json(user_bucket, &deletion_mark_path(id), &mark).await?;
                index.block_deletion_marks.push(IndexDeletionMark {
                    id,
                    deletion_time: now,
                });
                self.metrics
                    .blocks_marked_for_deletion
                    .get_or_create(&UserReasonLabels {
                        user: user.to_string(),
                        reason: "compaction".to_string(),
                    })
                    .inc();
            }

            for partition in &info.partitions {
                user_bucket
                    .delete(&partition_visit_marker_path(group_id, partition.partition_id))
                    .await?;
            }
            user_bucket.delete(&info.file_path()).await?;
            index.block_deletion_marks.sort_by_key(|m| m.id);
            info!(user, group = group_id, "deleted completed partitioned group");
        }
        Ok(())
    }

    /// Emits per-tenant partition gauges from the not-yet-completed groups.
    async fn emit_user_partition_metrics(
        &self,
        user_bucket: &dyn Bucket,
        user: &str,
    ) -> Result<()> {
        let now = self.clock.now_secs();
        let lease = self.cfg.partition_visit_marker_timeout;

        let mut remaining = 0i64;
        let mut in_progress = 0i64;
        let mut oldest_offset = 0i64;

        for group_id in list_partitioned_group_ids(user_bucket).await? {
            let info = match read_partitioned_group_info(user_bucket, group_id).await {
                Ok(info) => info,
                Err(Error::NotFound { .. }) | Err(Error::Serialization(_)) => continue,
                Err(e) => return Err(e),
            };
            let status = group_status(user_bucket, &info, now, lease).await?;
            if status.all_completed(info.partition_count) {
                continue;
            }
            remaining += status.remaining() as i64;
            in_progress += status.in_progress as i64;
            oldest_offset = oldest_offset.max(now - info.creation_time);
        }

        let labels = UserLabels::new(user);
        self.partition_metrics
            .remaining_planned_partitions
            .get_or_create(&labels)
            .set(remaining);
        self.partition_metrics
            .in_progress_partitions
            .get_or_create(&labels)
            .set(in_progress);
        self.partition_metrics
            .oldest_partition_group_offset
            .get_or_create(&labels)
            .set(oldest_offset);
        Ok(())
    }

    /// Two-phase tenant teardown. First passes delete block data and stamp
    /// `finished_time`; once the stamp ages past the tenant cleanup delay, a
    /// later pass sweeps debug files, markers, and finally the tenant
    /// deletion mark itself so operators can audit in between.
    pub async fn clean_deleted_user(&self, user: &str) -> Result<()> {
        let user_bucket: Arc<dyn Bucket> =
            Arc::new(UserBucket::new(Arc::clone(&self.bucket), user));

        // Gauges published while the tenant was active must not linger.
        self.metrics.delete_user_series(user);
        self.partition_metrics.delete_user_series(user);

        let Some(mut mark) = read_tenant_deletion_mark(user_bucket.as_ref()).await? else {
            warn!(user, "tenant scheduled for deletion has no deletion mark, skipping");
            return Ok(());
        };

        if let Some(finished) = mark.finished_time {
            if self.clock.now_secs() - finished > self.cfg.tenant_cleanup_delay.as_secs() as i64 {
                self.delete_remaining_user_data(user_bucket.as_ref(), user)
                    .await?;
                user_bucket.delete(TENANT_DELETION_MARK_FILENAME).await?;
                info!(user, "tenant deletion finalized, all objects removed");
                return Ok(());
            }
        }

        let keys = user_bucket.list("").await?;
        let block_ids: BTreeSet<BlockId> = keys
            .iter()
            .filter_map(|key| parse_block_key(key).map(|(id, _)| id))
            .collect();

        let mut failed = 0usize;
        for id in &block_ids {
            match self.delete_block(user_bucket.as_ref(), *id).await {
                Ok(()) => {
                    self.metrics.blocks_cleaned.inc();
                }
                Err(e) => {
                    warn!(user, block = %id, error = %e, "failed to delete block of deleted tenant");
                    self.metrics.block_cleanup_failures.inc();
                    failed += 1;
                }
            }
        }

        // The index is derived data the tenant no longer needs.
        bucketindex::delete_index(user_bucket.as_ref()).await?;
        bucketindex::delete_sync_status(user_bucket.as_ref()).await?;

        if failed > 0 {
            // Not finished; the next pass retries from bucket truth.
            return Ok(());
        }

        if mark.finished_time.is_none() {
            mark.finished_time = Some(self.clock.now_secs());
            write_tenant_deletion_mark(user_bucket.as_ref(), &mark).await?;
            info!(
                user,
                blocks = block_ids.len(),
                "tenant block data deleted, awaiting final sweep"
            );
        }
        Ok(())
    }

    /// Deletes every key under the tenant except the tenant deletion mark
    /// and the cleaner visit marker held by this pass.
    async fn delete_remaining_user_data(&self, user_bucket: &dyn Bucket, user: &str) -> Result<()> {
        let keys = user_bucket.list("").await?;
        for key in &keys {
            if key == TENANT_DELETION_MARK_FILENAME || key == CLEANER_VISIT_MARKER_FILENAME {
                continue;
            }
            user_bucket.delete(key).await?;
        }
        debug!(user, deleted = keys.len(), "swept remaining tenant objects");
        Ok(())
    }

    /// Deletes every key of a block directory: data files first, deletion
    /// marks last, so an interrupted deletion is resumed rather than
    /// orphaned.
    async fn delete_block(&self, user_bucket: &dyn Bucket, id: BlockId) -> Result<()> {
        let keys = user_bucket.list(&id.to_string()).await?;
        let (marks, files): (Vec<&String>, Vec<&String>) = keys
            .iter()
            .partition(|key| key.ends_with(DELETION_MARK_FILENAME));

        for key in files {
            user_bucket.delete(key).await?;
        }
        for key in marks {
            // The global-markers decorator drops the mirror alongside.
            user_bucket.delete(key).await?;
        }
        // A partial block can carry only the global mirror.
        user_bucket.delete(&global_deletion_mark_path(id)).await?;
        Ok(())
    }

    /// Copies legacy block-local deletion marks to the global markers
    /// location, letting old buckets opt into single-listing enumeration.
    async fn migrate_deletion_marks(&self, user_bucket: &dyn Bucket, user: &str) -> Result<()> {
        let keys = user_bucket.list("").await?;
        let mut migrated = 0;
        for key in &keys {
            let Some((id, file)) = parse_block_key(key) else {
                continue;
            };
            if file != DELETION_MARK_FILENAME {
                continue;
            }
            let global = global_deletion_mark_path(id);
            if user_bucket.exists(&global).await? {
                continue;
            }
            let data = user_bucket.get(key).await?;
            user_bucket.upload(&global, data).await?;
            migrated += 1;
        }
        if migrated > 0 {
            info!(user, migrated, "migrated block deletion marks to the global location");
        }
        Ok(())
    }

    /// Flags the tenant as non-queryable after an access-denied error. The
    /// cleaner keeps running but deletes nothing it cannot confirm.
    async fn quarantine_user(&self, user_bucket: &dyn Bucket, user: &str) -> Result<()> {
        warn!(user, "tenant quarantined with customer-managed key error");
        self.publish_sync_status(user_bucket, SyncStatusKind::CustomerManagedKeyError)
            .await
    }

    /// Writes the sync status, preserving a previous quarantine horizon so a
    /// restored tenant does not become queryable before the TTL passed.
    async fn publish_sync_status(&self, user_bucket: &dyn Bucket, kind: SyncStatusKind) -> Result<()> {
        let previous = bucketindex::read_sync_status(user_bucket)
            .await
            .unwrap_or_default();
        let mut status = SyncStatus {
            status: kind,
            non_queryable_until: previous.non_queryable_until,
            version: SYNC_STATUS_VERSION,
        };
        if kind == SyncStatusKind::CustomerManagedKeyError {
            let until =
                self.clock.now_millis() + self.cfg.sync_status_quarantine_ttl.as_millis() as i64;
            status.non_queryable_until = status.non_queryable_until.max(until);
        }
        bucketindex::write_sync_status(user_bucket, &status).await
    }

    fn update_user_metrics(
        &self,
        user: &str,
        index: &Index,
        remaining_partials: usize,
        no_compact_blocks: usize,
    ) {
        let labels = UserLabels::new(user);
        self.metrics
            .tenant_blocks
            .get_or_create(&labels)
            .set(index.blocks.len() as i64);
        self.metrics
            .tenant_blocks_marked_for_deletion
            .get_or_create(&labels)
            .set(index.block_deletion_marks.len() as i64);
        self.metrics
            .tenant_blocks_partials
            .get_or_create(&labels)
            .set(remaining_partials as i64);
        self.metrics
            .tenant_blocks_no_compact
            .get_or_create(&labels)
            .set(no_compact_blocks as i64);

        if self.cfg_provider.parquet_converter_enabled(user) {
            // Only blocks compacted up to the smallest configured range are
            // converted, so narrower blocks do not count as unconverted.
            let min_range = self.cfg.block_ranges[0];
            let converted = index.blocks.iter().filter(|b| b.parquet.is_some()).count();
            let unconverted = index
                .blocks
                .iter()
                .filter(|b| b.parquet.is_none() && b.max_time - b.min_time >= min_range)
                .count();
            self.metrics
                .tenant_parquet_blocks
                .get_or_create(&labels)
                .set(converted as i64);
            self.metrics
                .tenant_parquet_unconverted_blocks
                .get_or_create(&labels)
                .set(unconverted as i64);
        }
    }

    /// Removes per-tenant gauge series for tenants that left the local
    /// shard since the previous pass.
    fn reconcile_user_metrics(&self, owned: &HashSet<String>) {
        let mut last = self.last_owned_users.lock();
        for user in last.difference(owned) {
            debug!(user = %user, "removing metrics for tenant no longer owned by this shard");
            self.metrics.delete_user_series(user);
            self.partition_metrics.delete_user_series(user);
        }
        *last = owned.clone();
    }
}
