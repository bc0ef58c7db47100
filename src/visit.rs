//! Advisory visit markers
//!
//! A visit marker is a lease object in the bucket: the holder refreshes it
//! while working and peers reclaim it once `now - visit_time` exceeds the
//! lease. There is no distributed lock — two workers may briefly race, the
//! last writer wins the marker, and on its next refresh the loser observes
//! foreign ownership and abandons. Work guarded by a visit marker must
//! therefore be idempotent at the output layer.

use crate::bucket::{get_json, upload_json, Bucket};
use crate::clock::BoundedClock;
use crate::{Error, Result};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const VISIT_MARKER_VERSION: u32 = 1;

/// Progress of the visited unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A lease object stored in the bucket.
pub trait VisitMarker:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Marker location, relative to the tenant scope.
    fn marker_path(&self) -> String;

    fn owner(&self) -> &str;

    /// Unix seconds of the last refresh.
    fn visit_time(&self) -> i64;

    fn status(&self) -> VisitStatus;

    /// Re-stamps the marker with a new owner, visit time, and status.
    fn renew(&mut self, owner: &str, now: i64, status: VisitStatus);

    fn is_expired(&self, now: i64, lease: Duration) -> bool {
        now - self.visit_time() > lease.as_secs() as i64
    }

    /// Whether the unit is actively held under an unexpired lease.
    fn is_visited(&self, now: i64, lease: Duration) -> bool {
        self.status() == VisitStatus::InProgress && !self.is_expired(now, lease)
    }
}

/// Reads a marker, treating an unparseable object as absent — markers are
/// advisory and a corrupt one must not wedge the unit of work forever.
pub async fn read_marker<M: VisitMarker>(bucket: &dyn Bucket, path: &str) -> Result<Option<M>> {
    match get_json::<M>(bucket, path).await {
        Ok(marker) => Ok(Some(marker)),
        Err(Error::NotFound { .. }) => Ok(None),
        Err(Error::Serialization(e)) => {
            warn!(path, error = %e, "unparseable visit marker, treating as absent");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Drives the lease protocol for one marker on behalf of one owner.
pub struct VisitMarkerManager<M: VisitMarker> {
    bucket: Arc<dyn Bucket>,
    owner: String,
    clock: Arc<BoundedClock>,
    marker: Mutex<M>,
}

impl<M: VisitMarker> VisitMarkerManager<M> {
    pub fn new(bucket: Arc<dyn Bucket>, owner: &str, clock: Arc<BoundedClock>, marker: M) -> Self {
        Self {
            bucket,
            owner: owner.to_string(),
            clock,
            marker: Mutex::new(marker),
        }
    }

    pub fn marker(&self) -> M {
        self.marker.lock().clone()
    }

    fn path(&self) -> String {
        self.marker.lock().marker_path()
    }

    async fn write(&self, status: VisitStatus) -> Result<()> {
        let now = self.clock.now_secs();
        let marker = {
            let mut marker = self.marker.lock();
            marker.renew(&self.owner, now, status);
            marker.clone()
        };
        upload_json(self.bucket.as_ref(), &marker.marker_path(), &marker).await
    }

    /// Claims the unit: succeeds when the marker is absent, terminal, or its
    /// lease has expired. Fails with [`Error::MarkerHeld`] when another
    /// owner holds an unexpired in-progress lease.
    pub async fn claim(&self, lease: Duration) -> Result<()> {
        let now = self.clock.now_secs();
        if let Some(existing) = read_marker::<M>(self.bucket.as_ref(), &self.path()).await? {
            if existing.owner() != self.owner && existing.is_visited(now, lease) {
                return Err(Error::MarkerHeld {
                    owner: existing.owner().to_string(),
                });
            }
        }
        self.write(VisitStatus::InProgress).await
    }

    /// Re-stamps the lease. Fails with [`Error::MarkerHeld`] when the marker
    /// was taken over by another owner — the caller must abandon the unit.
    pub async fn refresh(&self, lease: Duration) -> Result<()> {
        let now = self.clock.now_secs();
        if let Some(existing) = read_marker::<M>(self.bucket.as_ref(), &self.path()).await? {
            if existing.owner() != self.owner && existing.is_visited(now, lease) {
                return Err(Error::MarkerHeld {
                    owner: existing.owner().to_string(),
                });
            }
        }
        self.write(VisitStatus::InProgress).await
    }

    /// Refreshes the lease on `interval` until cancelled or lost.
    ///
    /// Returns `Ok(())` when cancelled; [`Error::MarkerHeld`] when ownership
    /// was lost mid-work.
    pub async fn run_refresh_loop(
        &self,
        interval: Duration,
        lease: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(lease).await {
                        if matches!(e, Error::MarkerHeld { .. }) {
                            debug!(path = %self.path(), "lost visit marker ownership, abandoning");
                        }
                        return Err(e);
                    }
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    pub async fn complete(&self) -> Result<()> {
        self.write(VisitStatus::Completed).await
    }

    pub async fn fail(&self) -> Result<()> {
        self.write(VisitStatus::Failed).await
    }

    /// Removes the marker object entirely.
    pub async fn delete(&self) -> Result<()> {
        self.bucket.delete(&self.path()).await
    }
}
