//! Integration tests for ring membership, ownership, and waits

mod common;

use basalt::ring::{
    hash_key, standard_delegate_chain, wait_instance_state, wait_ring_stability, InMemoryKv,
    InstanceState, JoiningRegisterDelegate, KvStore, Lifecycler, Ring, RingConfig,
};
use basalt::users::{ListScanner, RingShardFilter, ShardedScanner, UsersScanner};

use common::*;
use std::sync::Arc;
use std::time::Duration;

fn ring_config() -> RingConfig {
    RingConfig {
        num_tokens: 16,
        replication_factor: 1,
        heartbeat_period: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_secs(60),
        ..RingConfig::default()
    }
}

fn new_lifecycler(kv: &Arc<dyn KvStore>, id: &str) -> Lifecycler {
    let cfg = ring_config();
    let delegate = standard_delegate_chain(&cfg, Box::new(JoiningRegisterDelegate));
    Lifecycler::new(
        cfg,
        id.to_string(),
        format!("127.0.0.1:9000/{id}"),
        Arc::clone(kv),
        delegate,
    )
    .unwrap()
}

async fn register_active(kv: &Arc<dyn KvStore>, id: &str) -> Lifecycler {
    let lc = new_lifecycler(kv, id);
    lc.register().await.unwrap();
    lc.change_state(InstanceState::Active).await.unwrap();
    lc
}

#[tokio::test]
async fn test_ownership_changes_only_on_membership_changes() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let _lc1 = register_active(&kv, "instance-1").await;
    let _lc2 = register_active(&kv, "instance-2").await;
    let lc3 = register_active(&kv, "instance-3").await;

    let ring = Ring::new(ring_config(), Arc::clone(&kv)).unwrap();

    let keys: Vec<u32> = (0..32).map(|i| hash_key(&format!("tenant-{i}"))).collect();
    let before: Vec<Vec<String>> = {
        let mut owners = Vec::new();
        for key in &keys {
            owners.push(ring.owners(*key).await.unwrap());
        }
        owners
    };
    assert!(before.iter().all(|o| o.len() == 1));

    // Heartbeats alone must not move ownership.
    _lc1.heartbeat().await.unwrap();
    _lc2.heartbeat().await.unwrap();
    for (key, expected) in keys.iter().zip(&before) {
        assert_eq!(&ring.owners(*key).await.unwrap(), expected);
    }

    // An instance leaving redistributes only its own keys.
    lc3.stop().await.unwrap();
    for (key, previous) in keys.iter().zip(&before) {
        let current = ring.owners(*key).await.unwrap();
        assert_eq!(current.len(), 1);
        if previous[0] != "instance-3" {
            assert_eq!(&current, previous, "key owned by a surviving instance must not move");
        } else {
            assert_ne!(current[0], "instance-3");
        }
    }
}

#[tokio::test]
async fn test_joining_instances_do_not_serve_lookups() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let _active = register_active(&kv, "instance-1").await;
    let joining = new_lifecycler(&kv, "instance-2");
    joining.register().await.unwrap();

    let ring = Ring::new(ring_config(), Arc::clone(&kv)).unwrap();
    for i in 0..16 {
        let owners = ring.owners(hash_key(&format!("tenant-{i}"))).await.unwrap();
        assert_eq!(owners, vec!["instance-1".to_string()]);
    }
}

#[tokio::test]
async fn test_wait_instance_state_observes_transition() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let lc = Arc::new(new_lifecycler(&kv, "instance-1"));
    lc.register().await.unwrap();

    let ring = Ring::new(ring_config(), Arc::clone(&kv)).unwrap();
    wait_instance_state(&ring, "instance-1", InstanceState::Joining, Duration::from_secs(1))
        .await
        .unwrap();

    let flipper = Arc::clone(&lc);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flipper.change_state(InstanceState::Active).await.unwrap();
    });

    wait_instance_state(&ring, "instance-1", InstanceState::Active, Duration::from_secs(2))
        .await
        .unwrap();

    // A state that never arrives fails the caller on expiry.
    let err = wait_instance_state(
        &ring,
        "instance-1",
        InstanceState::Leaving,
        Duration::from_millis(200),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, basalt::Error::Timeout));
}

#[tokio::test]
async fn test_wait_ring_stability() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let _lc = register_active(&kv, "instance-1").await;

    let ring = Ring::new(ring_config(), Arc::clone(&kv)).unwrap();

    // A quiet ring stabilizes within the minimum window.
    wait_ring_stability(&ring, Duration::from_millis(200), Duration::from_secs(5))
        .await
        .unwrap();

    // A ring churning faster than the window never stabilizes before the
    // maximum wait.
    let churn_kv = Arc::clone(&kv);
    let churner = tokio::spawn(async move {
        for i in 0..20u32 {
            let lc = new_lifecycler(&churn_kv, &format!("churn-{i}"));
            lc.register().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let err = wait_ring_stability(&ring, Duration::from_secs(5), Duration::from_millis(800))
        .await
        .unwrap_err();
    assert!(matches!(err, basalt::Error::Timeout));
    churner.abort();
}

#[tokio::test]
async fn test_ring_sharded_scanner_ownership() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let _lc = register_active(&kv, "instance-1").await;

    let (bucket, _raw) = prepare_bucket();
    create_block(&bucket, "user-1", block_id(1), 10, 20).await;
    create_block(&bucket, "user-2", block_id(2), 10, 20).await;

    // The only ACTIVE instance owns every tenant.
    let ring = Arc::new(Ring::new(ring_config(), Arc::clone(&kv)).unwrap());
    let scanner = ShardedScanner::new(
        Box::new(ListScanner::new(Arc::clone(&bucket))),
        Arc::new(RingShardFilter::new(Arc::clone(&ring), "instance-1")),
    );
    let (active, deleted) = scanner.scan().await.unwrap();
    assert_eq!(active, vec!["user-1".to_string(), "user-2".to_string()]);
    assert!(deleted.is_empty());

    // An instance that is not in the ring owns nothing.
    let scanner = ShardedScanner::new(
        Box::new(ListScanner::new(Arc::clone(&bucket))),
        Arc::new(RingShardFilter::new(Arc::clone(&ring), "instance-9")),
    );
    let (active, deleted) = scanner.scan().await.unwrap();
    assert!(active.is_empty());
    assert!(deleted.is_empty());
}

#[tokio::test]
async fn test_two_instances_split_tenants() {
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
    let _lc1 = register_active(&kv, "instance-1").await;
    let _lc2 = register_active(&kv, "instance-2").await;

    let ring = Arc::new(Ring::new(ring_config(), Arc::clone(&kv)).unwrap());

    let mut owned1 = 0;
    let mut owned2 = 0;
    for i in 0..64 {
        let user = format!("user-{i}");
        let filter1 = RingShardFilter::new(Arc::clone(&ring), "instance-1");
        let filter2 = RingShardFilter::new(Arc::clone(&ring), "instance-2");
        use basalt::users::ShardFilter;
        let o1 = filter1.owns(&user).await.unwrap();
        let o2 = filter2.owns(&user).await.unwrap();
        assert!(o1 ^ o2, "every tenant has exactly one owner at replication factor 1");
        owned1 += o1 as usize;
        owned2 += o2 as usize;
    }
    assert!(owned1 > 0 && owned2 > 0, "both instances own a share of tenants");
}
