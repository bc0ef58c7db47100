//! Ring lifecycler and its delegate chain
//!
//! The lifecycler owns the local instance's entry in the ring: it registers
//! the instance, heartbeats it, and removes it on shutdown. Cross-cutting
//! behavior (auto-forget, token persistence, leave-on-stopping) composes as
//! a chain of delegate values — the outermost delegate is invoked first and
//! forwards to the inner chain.

use super::{
    generate_tokens, update_ring, InstanceDesc, InstanceState, KvStore, RingConfig, RingDesc,
};
use crate::Result;

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capability set of a lifecycler delegate.
///
/// Every method has a forwarding default so delegates only override the
/// hooks they care about.
pub trait LifecyclerDelegate: Send + Sync + 'static {
    /// Decides the initial state and token set when the instance registers.
    fn on_register(
        &self,
        cfg: &RingConfig,
        instance_id: &str,
        desc: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>);

    /// Called once the registration CAS succeeded with the final token set.
    fn on_tokens(&self, _instance_id: &str, _tokens: &[u32]) {}

    /// Called on every heartbeat with a mutable ring snapshot, before the
    /// local heartbeat timestamp is bumped.
    fn on_heartbeat(&self, _cfg: &RingConfig, _instance_id: &str, _now: i64, _desc: &mut RingDesc) {
    }

    /// Called while unregistering, with a mutable ring snapshot.
    fn on_stopping(&self, _instance_id: &str, _desc: &mut RingDesc) {}
}

/// Base delegate: reuse whatever tokens the ring already holds for this
/// instance, top up with fresh random tokens unique in the current snapshot,
/// and enter the ring as JOINING.
pub struct JoiningRegisterDelegate;

impl LifecyclerDelegate for JoiningRegisterDelegate {
    fn on_register(
        &self,
        cfg: &RingConfig,
        instance_id: &str,
        desc: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        let mut tokens = existing.map(|d| d.tokens.clone()).unwrap_or_default();
        let taken: HashSet<u32> = desc.taken_tokens();
        let missing = cfg.num_tokens.saturating_sub(tokens.len());
        if missing > 0 {
            debug!(instance_id, missing, "generating new ring tokens");
            tokens.extend(generate_tokens(missing, &taken));
        }
        tokens.sort_unstable();
        (InstanceState::Joining, tokens)
    }
}

/// Removes peers whose heartbeat is older than
/// `auto_forget_periods × heartbeat_timeout` whenever we heartbeat, bounding
/// topology recovery after ungraceful exits.
pub struct AutoForgetDelegate {
    next: Box<dyn LifecyclerDelegate>,
}

impl AutoForgetDelegate {
    pub fn new(next: Box<dyn LifecyclerDelegate>) -> Self {
        Self { next }
    }
}

impl LifecyclerDelegate for AutoForgetDelegate {
    fn on_register(
        &self,
        cfg: &RingConfig,
        instance_id: &str,
        desc: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        self.next.on_register(cfg, instance_id, desc, existing)
    }

    fn on_tokens(&self, instance_id: &str, tokens: &[u32]) {
        self.next.on_tokens(instance_id, tokens);
    }

    fn on_heartbeat(&self, cfg: &RingConfig, instance_id: &str, now: i64, desc: &mut RingDesc) {
        let forget_after =
            cfg.heartbeat_timeout.as_secs() as i64 * cfg.auto_forget_periods as i64;
        desc.instances.retain(|id, instance| {
            if id == instance_id || now - instance.heartbeat <= forget_after {
                return true;
            }
            warn!(
                instance_id = %id,
                last_heartbeat = instance.heartbeat,
                "auto-forgetting unhealthy ring instance"
            );
            false
        });
        self.next.on_heartbeat(cfg, instance_id, now, desc);
    }

    fn on_stopping(&self, instance_id: &str, desc: &mut RingDesc) {
        self.next.on_stopping(instance_id, desc);
    }
}

/// Loads tokens from a file at registration (when the ring holds none) and
/// persists the assigned tokens after registration, so a restarted instance
/// reclaims the same circle positions.
pub struct TokensPersistencyDelegate {
    path: PathBuf,
    next: Box<dyn LifecyclerDelegate>,
}

impl TokensPersistencyDelegate {
    pub fn new(path: PathBuf, next: Box<dyn LifecyclerDelegate>) -> Self {
        Self { path, next }
    }

    fn load_tokens(&self) -> Option<Vec<u32>> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl LifecyclerDelegate for TokensPersistencyDelegate {
    fn on_register(
        &self,
        cfg: &RingConfig,
        instance_id: &str,
        desc: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        if existing.is_none() {
            if let Some(tokens) = self.load_tokens().filter(|t| !t.is_empty()) {
                info!(
                    instance_id,
                    tokens = tokens.len(),
                    path = %self.path.display(),
                    "restored ring tokens from file"
                );
                let restored = InstanceDesc {
                    addr: String::new(),
                    zone: cfg.zone.clone(),
                    state: InstanceState::Joining,
                    tokens,
                    heartbeat: 0,
                };
                return self.next.on_register(cfg, instance_id, desc, Some(&restored));
            }
        }
        self.next.on_register(cfg, instance_id, desc, existing)
    }

    fn on_tokens(&self, instance_id: &str, tokens: &[u32]) {
        match serde_json::to_vec(tokens) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist ring tokens");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize ring tokens"),
        }
        self.next.on_tokens(instance_id, tokens);
    }

    fn on_heartbeat(&self, cfg: &RingConfig, instance_id: &str, now: i64, desc: &mut RingDesc) {
        self.next.on_heartbeat(cfg, instance_id, now, desc);
    }

    fn on_stopping(&self, instance_id: &str, desc: &mut RingDesc) {
        self.next.on_stopping(instance_id, desc);
    }
}

/// Transitions the local instance to LEAVING before it is unregistered, so
/// observers stop routing to it during the drain.
pub struct LeaveOnStoppingDelegate {
    next: Box<dyn LifecyclerDelegate>,
}

impl LeaveOnStoppingDelegate {
    pub fn new(next: Box<dyn LifecyclerDelegate>) -> Self {
        Self { next }
    }
}

impl LifecyclerDelegate for LeaveOnStoppingDelegate {
    fn on_register(
        &self,
        cfg: &RingConfig,
        instance_id: &str,
        desc: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        self.next.on_register(cfg, instance_id, desc, existing)
    }

    fn on_tokens(&self, instance_id: &str, tokens: &[u32]) {
        self.next.on_tokens(instance_id, tokens);
    }

    fn on_heartbeat(&self, cfg: &RingConfig, instance_id: &str, now: i64, desc: &mut RingDesc) {
        self.next.on_heartbeat(cfg, instance_id, now, desc);
    }

    fn on_stopping(&self, instance_id: &str, desc: &mut RingDesc) {
        if let Some(instance) = desc.instances.get_mut(instance_id) {
            instance.state = InstanceState::Leaving;
        }
        self.next.on_stopping(instance_id, desc);
    }
}

/// Builds the standard delegate chain used by compactor and store-gateway:
/// auto-forget → tokens-persistency (optional) → leave-on-stopping →
/// component registration hook.
pub fn standard_delegate_chain(
    cfg: &RingConfig,
    component_hook: Box<dyn LifecyclerDelegate>,
) -> Box<dyn LifecyclerDelegate> {
    let mut delegate: Box<dyn LifecyclerDelegate> =
        Box::new(LeaveOnStoppingDelegate::new(component_hook));
    if let Some(path) = &cfg.tokens_file_path {
        delegate = Box::new(TokensPersistencyDelegate::new(path.clone(), delegate));
    }
    Box::new(AutoForgetDelegate::new(delegate))
}

/// Owns the local instance's ring membership.
pub struct Lifecycler {
    cfg: RingConfig,
    instance_id: String,
    instance_addr: String,
    kv: Arc<dyn KvStore>,
    delegate: Box<dyn LifecyclerDelegate>,
    tokens: RwLock<Vec<u32>>,
    state: RwLock<InstanceState>,
    shutdown: CancellationToken,
}

impl Lifecycler {
    pub fn new(
        cfg: RingConfig,
        instance_id: String,
        instance_addr: String,
        kv: Arc<dyn KvStore>,
        delegate: Box<dyn LifecyclerDelegate>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            instance_id,
            instance_addr,
            kv,
            delegate,
            tokens: RwLock::new(Vec::new()),
            state: RwLock::new(InstanceState::Pending),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.tokens.read().clone()
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Registers the instance in the ring through the delegate chain.
    pub async fn register(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut assigned_state = InstanceState::Joining;
        let mut assigned_tokens = Vec::new();

        update_ring(&self.kv, &self.cfg.key, |mut desc| {
            let existing = desc.instances.get(&self.instance_id).cloned();
            let (state, tokens) =
                self.delegate
                    .on_register(&self.cfg, &self.instance_id, &desc, existing.as_ref());
            assigned_state = state;
            assigned_tokens = tokens.clone();
            desc.instances.insert(
                self.instance_id.clone(),
                InstanceDesc {
                    addr: self.instance_addr.clone(),
                    zone: self.cfg.zone.clone(),
                    state,
                    tokens,
                    heartbeat: now,
                },
            );
            Some(desc)
        })
        .await?;

        *self.state.write() = assigned_state;
        *self.tokens.write() = assigned_tokens.clone();
        self.delegate.on_tokens(&self.instance_id, &assigned_tokens);

        info!(
            instance_id = %self.instance_id,
            state = ?assigned_state,
            tokens = assigned_tokens.len(),
            "instance registered in the ring"
        );
        Ok(())
    }

    /// Bumps the local heartbeat and runs the delegate chain (auto-forget
    /// scans peers here). A forgotten local instance re-inserts itself.
    pub async fn heartbeat(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        update_ring(&self.kv, &self.cfg.key, |mut desc| {
            self.delegate
                .on_heartbeat(&self.cfg, &self.instance_id, now, &mut desc);
            let state = *self.state.read();
            match desc.instances.entry(self.instance_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let instance = entry.get_mut();
                    instance.heartbeat = now;
                    instance.state = state;
                }
                Entry::Vacant(entry) => {
                    warn!(
                        instance_id = %self.instance_id,
                        "instance missing from the ring, re-registering"
                    );
                    entry.insert(InstanceDesc {
                        addr: self.instance_addr.clone(),
                        zone: self.cfg.zone.clone(),
                        state,
                        tokens: self.tokens.read().clone(),
                        heartbeat: now,
                    });
                }
            }
            Some(desc)
        })
        .await?;
        Ok(())
    }

    /// Moves the instance to a new lifecycle state in the ring.
    pub async fn change_state(&self, state: InstanceState) -> Result<()> {
        *self.state.write() = state;
        update_ring(&self.kv, &self.cfg.key, |mut desc| {
            let instance = desc.instances.get_mut(&self.instance_id)?;
            if instance.state == state {
                return None;
            }
            instance.state = state;
            Some(desc)
        })
        .await?;
        info!(instance_id = %self.instance_id, state = ?state, "instance changed ring state");
        Ok(())
    }

    /// Runs the heartbeat loop until the shutdown token fires.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.cfg.heartbeat_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(instance_id = %self.instance_id, error = %e, "ring heartbeat failed");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!(instance_id = %self.instance_id, "heartbeat loop stopping");
                    break;
                }
            }
        }
    }

    /// Unregisters the instance: delegate chain first (leave-on-stopping
    /// flips the state to LEAVING), then removal from the descriptor.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();

        update_ring(&self.kv, &self.cfg.key, |mut desc| {
            self.delegate.on_stopping(&self.instance_id, &mut desc);
            Some(desc)
        })
        .await?;

        update_ring(&self.kv, &self.cfg.key, |mut desc| {
            desc.instances.remove(&self.instance_id).map(|_| desc)
        })
        .await?;

        info!(instance_id = %self.instance_id, "instance unregistered from the ring");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::InMemoryKv;

    fn lifecycler(kv: Arc<dyn KvStore>, id: &str) -> Lifecycler {
        let cfg = RingConfig {
            num_tokens: 4,
            ..RingConfig::default()
        };
        let delegate = standard_delegate_chain(&cfg, Box::new(JoiningRegisterDelegate));
        Lifecycler::new(cfg, id.to_string(), "127.0.0.1:9000".to_string(), kv, delegate).unwrap()
    }

    #[tokio::test]
    async fn test_register_assigns_unique_tokens() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let lc1 = lifecycler(kv.clone(), "instance-1");
        let lc2 = lifecycler(kv.clone(), "instance-2");

        lc1.register().await.unwrap();
        lc2.register().await.unwrap();

        let (desc, _) = kv.get("ring").await.unwrap().unwrap();
        assert_eq!(desc.instances.len(), 2);
        assert_eq!(desc.taken_tokens().len(), 8, "tokens must be globally unique");
        assert_eq!(desc.instances["instance-1"].state, InstanceState::Joining);
    }

    #[tokio::test]
    async fn test_register_reuses_existing_tokens() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let lc = lifecycler(kv.clone(), "instance-1");
        lc.register().await.unwrap();
        let first_tokens = lc.tokens();

        // Re-registering (e.g. after a restart with the ring entry intact)
        // keeps the same tokens.
        let lc = lifecycler(kv.clone(), "instance-1");
        lc.register().await.unwrap();
        assert_eq!(lc.tokens(), first_tokens);
    }

    #[tokio::test]
    async fn test_tokens_persist_across_ring_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let cfg = RingConfig {
            num_tokens: 4,
            tokens_file_path: Some(path.clone()),
            ..RingConfig::default()
        };

        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let delegate = standard_delegate_chain(&cfg, Box::new(JoiningRegisterDelegate));
        let lc = Lifecycler::new(
            cfg.clone(),
            "instance-1".to_string(),
            "127.0.0.1:9000".to_string(),
            kv,
            delegate,
        )
        .unwrap();
        lc.register().await.unwrap();
        let tokens = lc.tokens();
        assert!(path.exists());

        // Fresh KV store (ring wiped), same tokens file: positions come back.
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let delegate = standard_delegate_chain(&cfg, Box::new(JoiningRegisterDelegate));
        let lc = Lifecycler::new(
            cfg,
            "instance-1".to_string(),
            "127.0.0.1:9000".to_string(),
            kv,
            delegate,
        )
        .unwrap();
        lc.register().await.unwrap();
        assert_eq!(lc.tokens(), tokens);
    }

    #[tokio::test]
    async fn test_auto_forget_removes_stale_peer() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let lc1 = lifecycler(kv.clone(), "instance-1");
        let lc2 = lifecycler(kv.clone(), "instance-2");
        lc1.register().await.unwrap();
        lc2.register().await.unwrap();

        // Age instance-2's heartbeat beyond the auto-forget horizon.
        let (mut desc, version) = kv.get("ring").await.unwrap().unwrap();
        let forget_after = 10 * 60; // auto_forget_periods × heartbeat_timeout
        desc.instances.get_mut("instance-2").unwrap().heartbeat =
            Utc::now().timestamp() - forget_after - 100;
        kv.cas("ring", version, desc).await.unwrap();

        lc1.heartbeat().await.unwrap();

        let (desc, _) = kv.get("ring").await.unwrap().unwrap();
        assert!(desc.instances.contains_key("instance-1"));
        assert!(
            !desc.instances.contains_key("instance-2"),
            "stale instance must be auto-forgotten"
        );
    }

    #[tokio::test]
    async fn test_stop_removes_instance() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let lc = lifecycler(kv.clone(), "instance-1");
        lc.register().await.unwrap();
        lc.change_state(InstanceState::Active).await.unwrap();
        lc.stop().await.unwrap();

        let (desc, _) = kv.get("ring").await.unwrap().unwrap();
        assert!(desc.instances.is_empty());
    }
}
