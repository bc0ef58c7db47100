//! Hash ring membership and ownership
//!
//! A replicated membership set with one entry per instance, each holding a
//! set of 32-bit tokens on the 2³²-circle plus a liveness heartbeat and
//! zone. Ownership of a key is resolved by hashing it onto the circle and
//! walking clockwise until enough distinct-by-zone ACTIVE instances are
//! collected. All mutations go through compare-and-swap on the backing KV
//! store; readers receive eventually-consistent snapshots.

mod kv;
mod lifecycler;

pub use kv::{InMemoryKv, KvStore};
pub use lifecycler::{
    standard_delegate_chain, AutoForgetDelegate, JoiningRegisterDelegate, LeaveOnStoppingDelegate,
    Lifecycler, LifecyclerDelegate, TokensPersistencyDelegate,
};

use crate::{Error, Result};

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Maximum number of CAS retries for ring mutations
const MAX_CAS_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds for exponential backoff
const BASE_BACKOFF_MS: u64 = 100;

/// Lifecycle state of a ring instance.
///
/// Unhealthy is not a stored state: it is derived from heartbeat staleness
/// by every observer, so a partitioned instance needs no writer to appear
/// unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    /// Registered, tokens not yet assigned
    Pending,
    /// Tokens assigned, initial sync still running — not serving yet
    Joining,
    /// Serving
    Active,
    /// Draining before unregistering
    Leaving,
}

/// One ring member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub addr: String,
    #[serde(default)]
    pub zone: String,
    pub state: InstanceState,
    pub tokens: Vec<u32>,
    /// Unix seconds of the last heartbeat
    pub heartbeat: i64,
}

impl InstanceDesc {
    pub fn is_healthy(&self, now: i64, heartbeat_timeout: Duration) -> bool {
        now - self.heartbeat <= heartbeat_timeout.as_secs() as i64
    }
}

/// The replicated ring descriptor: at most one entry per instance id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingDesc {
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// All tokens currently claimed by any instance.
    pub fn taken_tokens(&self) -> HashSet<u32> {
        self.instances
            .values()
            .flat_map(|i| i.tokens.iter().copied())
            .collect()
    }

    /// Tokens sorted on the circle, each with its owning instance id.
    fn sorted_tokens(&self) -> Vec<(u32, &str)> {
        let mut tokens: Vec<(u32, &str)> = self
            .instances
            .iter()
            .flat_map(|(id, desc)| desc.tokens.iter().map(move |t| (*t, id.as_str())))
            .collect();
        tokens.sort_unstable_by_key(|(t, _)| *t);
        tokens
    }

    /// Fingerprint of the ring topology: ids, states, zones, and tokens.
    /// Heartbeat timestamps are deliberately excluded so periodic heartbeats
    /// do not count as topology changes.
    pub fn topology_fingerprint(&self) -> u64 {
        let mut hash = FNV64_OFFSET;
        for (id, desc) in &self.instances {
            hash = fnv1a64(hash, id.as_bytes());
            hash = fnv1a64(hash, desc.zone.as_bytes());
            hash = fnv1a64(hash, &[desc.state as u8]);
            for token in &desc.tokens {
                hash = fnv1a64(hash, &token.to_be_bytes());
            }
        }
        hash
    }
}

/// How unhealthy instances interact with the replication factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationStrategy {
    /// Unhealthy instances are skipped and do not count toward replication.
    #[default]
    Default,
    /// Unhealthy instances are skipped but consume a replication slot, so a
    /// lookup may return fewer owners than the replication factor.
    IgnoreUnhealthyInstances,
}

/// Ring configuration.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// KV store key holding the ring descriptor
    pub key: String,
    /// Number of tokens each instance claims on the circle
    pub num_tokens: usize,
    pub replication_factor: usize,
    pub heartbeat_period: Duration,
    pub heartbeat_timeout: Duration,
    /// Consecutive missed heartbeat-timeout periods after which any peer
    /// removes an unhealthy instance from the ring
    pub auto_forget_periods: u32,
    /// Optional file for token persistence across restarts
    pub tokens_file_path: Option<PathBuf>,
    pub wait_stability_min_duration: Duration,
    pub wait_stability_max_duration: Duration,
    pub wait_instance_state_timeout: Duration,
    /// Availability zone of the local instance
    pub zone: String,
    pub strategy: ReplicationStrategy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: "ring".to_string(),
            num_tokens: 128,
            replication_factor: 1,
            heartbeat_period: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(60),
            auto_forget_periods: 10,
            tokens_file_path: None,
            wait_stability_min_duration: Duration::from_secs(60),
            wait_stability_max_duration: Duration::from_secs(300),
            wait_instance_state_timeout: Duration::from_secs(600),
            zone: String::new(),
            strategy: ReplicationStrategy::Default,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_tokens == 0 {
            return Err(Error::Config("ring num-tokens must be greater than 0".to_string()));
        }
        if self.replication_factor == 0 {
            return Err(Error::Config(
                "ring replication-factor must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat_timeout < self.heartbeat_period {
            return Err(Error::Config(
                "ring heartbeat-timeout must not be shorter than heartbeat-period".to_string(),
            ));
        }
        Ok(())
    }
}

/// Block ownership sharding configuration.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub strategy: ShardingStrategy,
    /// Shuffle sharding only: size of each tenant's sub-ring
    pub tenant_shard_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardingStrategy {
    #[default]
    Default,
    Shuffle,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: ShardingStrategy::Default,
            tenant_shard_size: 0,
        }
    }
}

impl ShardingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled
            && self.strategy == ShardingStrategy::Shuffle
            && self.tenant_shard_size == 0
        {
            return Err(Error::Config(
                "tenant-shard-size must be greater than 0 with shuffle sharding".to_string(),
            ));
        }
        Ok(())
    }
}

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a32(mut hash: u32, bytes: &[u8]) -> u32 {
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

fn fnv1a64(mut hash: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// Hashes an arbitrary key onto the token circle.
pub fn hash_key(key: &str) -> u32 {
    fnv1a32(FNV32_OFFSET, key.as_bytes())
}

/// Hashes a block id onto the token circle.
pub fn hash_block_id(id: crate::block::BlockId) -> u32 {
    fnv1a32(FNV32_OFFSET, &id.to_bytes())
}

/// Generates `count` random tokens distinct from each other and from `taken`.
pub fn generate_tokens(count: usize, taken: &HashSet<u32>) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut tokens = Vec::with_capacity(count);
    let mut used = taken.clone();
    while tokens.len() < count {
        let token: u32 = rng.gen();
        if used.insert(token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Resolves the owners of `key` by walking the token circle clockwise.
pub fn lookup_owners(
    desc: &RingDesc,
    key: u32,
    replication_factor: usize,
    now: i64,
    heartbeat_timeout: Duration,
    strategy: ReplicationStrategy,
) -> Vec<String> {
    let tokens = desc.sorted_tokens();
    if tokens.is_empty() {
        return Vec::new();
    }

    let start = tokens.partition_point(|(t, _)| *t < key);
    let mut owners = Vec::new();
    let mut seen_instances: HashSet<&str> = HashSet::new();
    let mut seen_zones: HashSet<&str> = HashSet::new();
    let mut slots = 0usize;

    for i in 0..tokens.len() {
        if slots >= replication_factor {
            break;
        }
        let (_, id) = tokens[(start + i) % tokens.len()];
        if !seen_instances.insert(id) {
            continue;
        }
        let instance = &desc.instances[id];
        if instance.state != InstanceState::Active {
            continue;
        }

        let healthy = instance.is_healthy(now, heartbeat_timeout);
        if !healthy && strategy == ReplicationStrategy::Default {
            // Skipped entirely: it neither consumes a slot nor claims its
            // zone, so a later healthy instance in the same zone can still
            // be collected.
            continue;
        }
        // The distinct-zone constraint applies only to instances that
        // consume a replication slot.
        if !instance.zone.is_empty() && !seen_zones.insert(instance.zone.as_str()) {
            continue;
        }
        if healthy {
            owners.push(id.to_string());
        }
        // Under IgnoreUnhealthyInstances an unhealthy instance consumes the
        // slot (and its zone) without serving.
        slots += 1;
    }
    owners
}

/// Deterministic per-tenant sub-ring for shuffle sharding.
///
/// The subset is chosen by a tenant-seeded RNG over the sorted instance ids,
/// so every observer computes the same shard and a tenant's blast radius is
/// bounded by `shard_size` instances.
pub fn shuffle_shard(desc: &RingDesc, tenant: &str, shard_size: usize) -> RingDesc {
    if shard_size == 0 || shard_size >= desc.instances.len() {
        return desc.clone();
    }
    let ids: Vec<&String> = desc.instances.keys().collect();
    let seed = fnv1a64(FNV64_OFFSET, tenant.as_bytes());
    let mut rng = StdRng::seed_from_u64(seed);
    let chosen: Vec<&&String> = ids.choose_multiple(&mut rng, shard_size).collect();

    let mut shard = RingDesc::default();
    for id in chosen {
        shard
            .instances
            .insert((*id).clone(), desc.instances[*id].clone());
    }
    shard
}

/// Read view over the ring for ownership decisions.
///
/// Each call reads a point-in-time snapshot from the KV store; ownership may
/// change between calls — the visit-marker discipline absorbs this.
pub struct Ring {
    cfg: RingConfig,
    kv: Arc<dyn KvStore>,
}

impl Ring {
    pub fn new(cfg: RingConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, kv })
    }

    pub fn config(&self) -> &RingConfig {
        &self.cfg
    }

    pub async fn describe(&self) -> Result<RingDesc> {
        Ok(self
            .kv
            .get(&self.cfg.key)
            .await?
            .map(|(desc, _)| desc)
            .unwrap_or_default())
    }

    /// Owners of `key` under the configured replication factor.
    pub async fn owners(&self, key: u32) -> Result<Vec<String>> {
        let desc = self.describe().await?;
        Ok(lookup_owners(
            &desc,
            key,
            self.cfg.replication_factor,
            Utc::now().timestamp(),
            self.cfg.heartbeat_timeout,
            self.cfg.strategy,
        ))
    }

    /// Whether `instance_id` is among the owners of `key` under the
    /// configured replication factor. With a replication factor above one,
    /// several instances own the same key and each reports `true`; callers
    /// mutating shared state rely on the visit-marker discipline to stay
    /// single-writer.
    pub async fn is_owned_by(&self, key: u32, instance_id: &str) -> Result<bool> {
        Ok(self.owners(key).await?.iter().any(|id| id == instance_id))
    }

    pub async fn instance_state(&self, instance_id: &str) -> Result<Option<InstanceState>> {
        Ok(self
            .describe()
            .await?
            .instances
            .get(instance_id)
            .map(|i| i.state))
    }
}

/// Applies `mutate` to the current ring descriptor under CAS, retrying
/// conflicts with bounded exponential backoff. `mutate` returning `None`
/// means no update is needed.
pub(crate) async fn update_ring<F>(
    kv: &Arc<dyn KvStore>,
    key: &str,
    mut mutate: F,
) -> Result<RingDesc>
where
    F: FnMut(RingDesc) -> Option<RingDesc> + Send,
{
    for retry in 0..MAX_CAS_RETRIES {
        let (desc, version) = kv
            .get(key)
            .await?
            .unwrap_or_else(|| (RingDesc::default(), 0));
        let Some(new_desc) = mutate(desc.clone()) else {
            return Ok(desc);
        };
        match kv.cas(key, version, new_desc.clone()).await {
            Ok(_) => return Ok(new_desc),
            Err(Error::Conflict) => {
                let backoff_ms = BASE_BACKOFF_MS * 2_u64.pow(retry);
                warn!(key, retry = retry + 1, backoff_ms, "ring CAS conflict, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::TooManyRetries)
}

/// Polls the ring until `instance_id` is observed in `state`.
///
/// Fails with [`Error::Timeout`] when the deadline expires.
pub async fn wait_instance_state(
    ring: &Ring,
    instance_id: &str,
    state: InstanceState,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if ring.instance_state(instance_id).await? == Some(state) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Waits until the ring topology has been unchanged for `min_stability`.
///
/// Bails out with [`Error::Timeout`] after `max_waiting`; callers typically
/// log a warning and proceed, accepting some block reshuffling.
pub async fn wait_ring_stability(
    ring: &Ring,
    min_stability: Duration,
    max_waiting: Duration,
) -> Result<()> {
    let started = Instant::now();
    let mut fingerprint = ring.describe().await?.topology_fingerprint();
    let mut last_change = Instant::now();

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        let current = ring.describe().await?.topology_fingerprint();
        if current != fingerprint {
            fingerprint = current;
            last_change = Instant::now();
        }
        if last_change.elapsed() >= min_stability {
            return Ok(());
        }
        if started.elapsed() >= max_waiting {
            return Err(Error::Timeout);
        }
    }
}
