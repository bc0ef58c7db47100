//! Pluggable KV store backing the hash ring
//!
//! The ring descriptor is a single value mutated exclusively through
//! versioned compare-and-swap. The in-memory backend is used by tests and
//! single-process deployments; distributed consensus backends (consul, etcd,
//! memberlist) implement the same trait out of crate.

use super::RingDesc;
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Versioned key-value storage for ring descriptors.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the descriptor and its version, if the key exists.
    async fn get(&self, key: &str) -> Result<Option<(RingDesc, u64)>>;

    /// Compare-and-swap: writes `desc` only if the stored version still
    /// equals `expected_version` (0 meaning "the key must not exist yet").
    /// Returns the new version, or [`Error::Conflict`] on mismatch.
    async fn cas(&self, key: &str, expected_version: u64, desc: RingDesc) -> Result<u64>;
}

/// In-memory KV store.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, (RingDesc, u64)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<(RingDesc, u64)>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn cas(&self, key: &str, expected_version: u64, desc: RingDesc) -> Result<u64> {
        let mut entries = self.entries.lock();
        let current_version = entries.get(key).map(|(_, v)| *v).unwrap_or(0);
        if current_version != expected_version {
            return Err(Error::Conflict);
        }
        let new_version = current_version + 1;
        entries.insert(key.to_string(), (desc, new_version));
        Ok(new_version)
    }
}
