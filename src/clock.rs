//! Monotonic clock source with skew mitigation
//!
//! Provides a wall-clock timestamp that never goes backward, and a
//! configurable safety margin for retention and deletion-delay decisions.
//! Deletion marks are stamped by whichever cleaner instance wrote them, so
//! the delay enforced against them must tolerate skew between instances.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source that guarantees monotonically increasing timestamps
/// and provides skew-aware cutoffs for retention decisions.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
    /// Maximum tolerated clock skew (millis). Applied as a safety margin
    /// when computing retention cutoffs to avoid premature deletion.
    max_skew_ms: i64,
}

impl BoundedClock {
    /// Create a new BoundedClock with the given maximum skew tolerance.
    pub fn new(max_skew: std::time::Duration) -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
            max_skew_ms: max_skew.as_millis() as i64,
        }
    }

    /// Returns a monotonically increasing millisecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark + 1ms instead.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// Returns a monotonically increasing unix-seconds timestamp.
    ///
    /// Marker objects (deletion marks, visit markers) are stamped in seconds.
    pub fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }

    /// Returns `chrono::DateTime<Utc>` from the monotonic clock.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_else(Utc::now)
    }

    /// Returns a retention cutoff timestamp (millis) that accounts for skew.
    ///
    /// The cutoff is shifted earlier by `max_skew` so that blocks whose
    /// max-time was recorded on a clock running ahead are not marked for
    /// deletion prematurely.
    pub fn retention_cutoff_millis(&self, retention: std::time::Duration) -> i64 {
        self.now_millis() - retention.as_millis() as i64 - self.max_skew_ms
    }

    /// Returns the configured max skew tolerance.
    pub fn max_skew(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.max_skew_ms as u64)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        // 30 second default — generous enough for most NTP-synced environments
        Self::new(std::time::Duration::from_secs(30))
    }
}
