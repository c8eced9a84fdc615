//! Integration tests for the worker pool.
//!
//! Tenants here are plain counters, so the tests exercise grouping,
//! rebalancing and fault isolation without any book logic.
//!
//! # Running
//!
//! ```bash
//! cargo test --test distributor
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use book_sync::config::DistributorConfig;
use book_sync::distributor::{Tenant, WorkerPool};
use book_sync::Error;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Healthy,
    Failing,
    Panicking,
    Slow(Duration),
}

struct Stub {
    key: String,
    behavior: Behavior,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    disposed: AtomicBool,
}

impl Stub {
    fn new(key: impl Into<String>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            behavior,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tenant for Stub {
    fn key(&self) -> &str {
        &self.key
    }

    fn maintain(&self) -> book_sync::Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let result = match self.behavior {
            Behavior::Healthy => Ok(()),
            Behavior::Failing => Err(Error::InvalidDiff("synthetic".into())),
            Behavior::Panicking => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                panic!("synthetic panic in {}", self.key);
            }
            Behavior::Slow(delay) => {
                thread::sleep(delay);
                Ok(())
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

fn pool(max_tenants: usize) -> WorkerPool {
    WorkerPool::new(DistributorConfig::default().with_max_tenants(max_tenants)).unwrap()
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn registered(pool: &WorkerPool) -> Vec<String> {
    pool.groups().into_iter().flat_map(|g| g.tenants).collect()
}

// ============================================================================
// Grouping
// ============================================================================

#[test]
fn test_ten_tenants_in_groups_of_four() {
    let pool = pool(4);
    let stubs: Vec<_> = (0..10).map(|i| Stub::new(format!("s{i}"), Behavior::Healthy)).collect();
    for stub in &stubs {
        assert!(pool.register(stub.clone()).unwrap());
    }
    assert_eq!(pool.group_sizes(), vec![4, 4, 2]);
    assert_eq!(pool.worker_count(), 3);

    // s9 sits in the group of two
    let last = pool.group_of("s9").unwrap();
    assert!(pool.unregister("s9").is_some());
    assert_eq!(pool.group_sizes(), vec![4, 4, 1]);
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.group_of("s8"), Some(last));

    // the surviving member of that group is still serviced
    let before = stubs[8].calls();
    assert!(wait_for(|| stubs[8].calls() > before + 2));
}

#[test]
fn test_every_tenant_is_serviced() {
    let pool = pool(3);
    let stubs: Vec<_> = (0..7).map(|i| Stub::new(format!("s{i}"), Behavior::Healthy)).collect();
    for stub in &stubs {
        pool.register(stub.clone()).unwrap();
    }
    assert!(wait_for(|| stubs.iter().all(|p| p.calls() >= 3)));
}

// ============================================================================
// Redistribution
// ============================================================================

#[test]
fn test_redistribute_preserves_membership() {
    let pool = pool(4);
    let stubs: Vec<_> = (0..10).map(|i| Stub::new(format!("s{i}"), Behavior::Healthy)).collect();
    for stub in &stubs {
        pool.register(stub.clone()).unwrap();
    }
    let before: BTreeSet<String> = registered(&pool).into_iter().collect();

    for max in [1, 3, 7, 255, 2] {
        pool.redistribute(max).unwrap();

        let after = registered(&pool);
        assert_eq!(after.len(), 10, "tenant lost or duplicated at max {max}");
        assert_eq!(after.into_iter().collect::<BTreeSet<_>>(), before);
        assert!(pool.group_sizes().iter().all(|&n| n <= max));
        assert_eq!(pool.worker_count(), 10_usize.div_ceil(max));
    }

    // still serviced after the last cutover
    let snapshot: Vec<usize> = stubs.iter().map(|p| p.calls()).collect();
    assert!(wait_for(|| stubs.iter().zip(&snapshot).all(|(p, &n)| p.calls() > n)));
}

#[test]
fn test_redistribute_never_overlaps_maintenance() {
    let pool = pool(2);
    let stubs: Vec<_> = (0..6)
        .map(|i| Stub::new(format!("s{i}"), Behavior::Slow(Duration::from_millis(2))))
        .collect();
    for stub in &stubs {
        pool.register(stub.clone()).unwrap();
    }

    for round in 0..20 {
        pool.redistribute(1 + round % 3).unwrap();
    }
    thread::sleep(Duration::from_millis(20));

    for stub in &stubs {
        assert_eq!(stub.max_active.load(Ordering::SeqCst), 1, "{} ran concurrently", stub.key);
    }
}

#[test]
fn test_set_config_applies_to_new_groups() {
    let pool = pool(2);
    for i in 0..2 {
        pool.register(Stub::new(format!("a{i}"), Behavior::Healthy)).unwrap();
    }
    pool.set_config(DistributorConfig::default().with_max_tenants(5)).unwrap();

    // existing groups accept tenants up to the new limit
    pool.register(Stub::new("b0", Behavior::Healthy)).unwrap();
    assert_eq!(pool.group_sizes(), vec![3]);

    assert!(pool
        .set_config(DistributorConfig::default().with_idle_sleep_time(101))
        .is_err());
    assert_eq!(pool.config().max_tenants(), 5);
}

// ============================================================================
// Fault isolation and teardown
// ============================================================================

#[test]
fn test_faulty_tenants_do_not_stop_their_group() {
    let pool = pool(4);
    let failing = Stub::new("failing", Behavior::Failing);
    let panicking = Stub::new("panicking", Behavior::Panicking);
    let healthy = Stub::new("healthy", Behavior::Healthy);

    pool.register(failing.clone()).unwrap();
    pool.register(panicking.clone()).unwrap();
    pool.register(healthy.clone()).unwrap();
    assert_eq!(pool.group_sizes(), vec![3]);

    assert!(wait_for(|| healthy.calls() >= 5));
    assert!(panicking.calls() >= 2, "panicking tenant must stay scheduled");
    assert!(failing.calls() >= 2, "failing tenant must stay scheduled");

    let groups = pool.groups();
    let group = &groups[0];
    assert!(group.faults >= 4);
    assert!(group.cycles >= 4);
    assert_eq!(pool.worker_count(), 1);
}

#[test]
fn test_disposed_tenant_is_skipped() {
    let pool = pool(4);
    let stub = Stub::new("gone", Behavior::Healthy);
    pool.register(stub.clone()).unwrap();
    assert!(wait_for(|| stub.calls() >= 1));

    stub.disposed.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    let frozen = stub.calls();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(stub.calls(), frozen);
    assert!(pool.contains("gone"));
}

#[test]
fn test_unregister_waits_for_inflight_maintenance() {
    let pool = pool(4);
    let slow = Stub::new("slow", Behavior::Slow(Duration::from_millis(40)));
    pool.register(slow.clone()).unwrap();
    assert!(wait_for(|| slow.active.load(Ordering::SeqCst) == 1));

    let tenant = pool.unregister("slow").unwrap();
    assert_eq!(tenant.key(), "slow");
    assert_eq!(slow.active.load(Ordering::SeqCst), 0);

    let calls = slow.calls();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(slow.calls(), calls);
    assert_eq!(pool.worker_count(), 0);
}

#[test]
fn test_shutdown_stops_all_workers() {
    let pool = pool(1);
    let stubs: Vec<_> = (0..3).map(|i| Stub::new(format!("s{i}"), Behavior::Healthy)).collect();
    for stub in &stubs {
        pool.register(stub.clone()).unwrap();
    }
    assert!(wait_for(|| stubs.iter().all(|p| p.calls() > 0)));

    pool.shutdown();
    let counts: Vec<usize> = stubs.iter().map(|p| p.calls()).collect();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(stubs.iter().map(|p| p.calls()).collect::<Vec<_>>(), counts);
    assert_eq!(pool.worker_count(), 0);
    assert!(matches!(
        pool.register(Stub::new("late", Behavior::Healthy)),
        Err(Error::Disposed(_))
    ));
}
