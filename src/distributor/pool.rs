//! Group membership and the workers behind it.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::{DistributorConfig, WorkerPriority};
use crate::error::Error;
use crate::Result;

use super::worker::{GroupId, TenantSlot, Worker};
use super::Tenant;

/// Point-in-time description of one tenant group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group identity
    pub id: GroupId,
    /// Keys of the tenants in service order
    pub tenants: Vec<String>,
    /// Completed worker cycles
    pub cycles: u64,
    /// Maintenance calls that returned an error or panicked
    pub faults: u64,
    /// Priority the worker thread runs at, if it could be applied
    pub priority: Option<WorkerPriority>,
}

struct PoolInner {
    workers: Vec<Worker>,
    membership: FxHashMap<String, GroupId>,
    next_id: u64,
    shut_down: bool,
}

impl PoolInner {
    fn allocate_id(&mut self) -> GroupId {
        self.next_id += 1;
        GroupId(self.next_id)
    }

    fn position(&self, id: GroupId) -> Option<usize> {
        self.workers.iter().position(|worker| worker.id() == id)
    }
}

/// Owned pool of background workers servicing [`Tenant`]s.
///
/// Every registered tenant belongs to exactly one group, and every group is
/// served by exactly one thread. The membership table sits behind its own
/// lock, separate from the per-tenant service locks, so registration changes
/// never wait on slow maintenance of unrelated tenants.
pub struct WorkerPool {
    config: RwLock<DistributorConfig>,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Create an empty pool; no threads start until the first registration
    pub fn new(config: DistributorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            inner: Mutex::new(PoolInner {
                workers: Vec::new(),
                membership: FxHashMap::default(),
                next_id: 0,
                shut_down: false,
            }),
        })
    }

    /// Current configuration
    pub fn config(&self) -> DistributorConfig {
        *self.config.read()
    }

    /// Replace the configuration.
    ///
    /// Existing groups keep their settings; new groups and the next
    /// [`redistribute`](Self::redistribute) use the new ones.
    pub fn set_config(&self, config: DistributorConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        debug!(?config, "distributor config updated");
        Ok(())
    }

    /// Add a tenant to the first group with spare capacity, starting a new
    /// worker when every group is full.
    ///
    /// Returns `false` if a tenant with the same key is already registered.
    pub fn register(&self, tenant: Arc<dyn Tenant>) -> Result<bool> {
        let config = self.config();
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(Error::Disposed("worker pool".into()));
        }

        let key = tenant.key().to_string();
        if inner.membership.contains_key(&key) {
            return Ok(false);
        }

        let slot = Arc::new(TenantSlot::new(tenant));
        let max = config.max_tenants();

        let open = inner.workers.iter().position(|worker| worker.len() < max);
        let id = match open {
            Some(index) => {
                inner.workers[index].push(slot);
                inner.workers[index].id()
            }
            None => {
                let id = inner.allocate_id();
                let mut worker = Worker::new(id, config, vec![slot]);
                worker.start()?;
                inner.workers.push(worker);
                info!(group = %id, workers = inner.workers.len(), "worker group created");
                id
            }
        };

        debug!(tenant = %key, group = %id, "tenant registered");
        inner.membership.insert(key, id);
        Ok(true)
    }

    /// Remove a tenant from its group.
    ///
    /// When this returns, no maintenance call for the tenant is running and
    /// none will start. A group left empty has its worker stopped and joined.
    pub fn unregister(&self, key: &str) -> Option<Arc<dyn Tenant>> {
        let (slot, emptied) = {
            let mut inner = self.inner.lock();
            let id = inner.membership.remove(key)?;
            let index = inner.position(id)?;
            let slot = inner.workers[index].remove(key)?;
            let emptied = if inner.workers[index].is_empty() {
                Some(inner.workers.remove(index))
            } else {
                None
            };
            (slot, emptied)
        };

        slot.retire();
        debug!(tenant = %key, "tenant unregistered");

        if let Some(mut worker) = emptied {
            let id = worker.id();
            worker.stop();
            info!(group = %id, "worker group destroyed");
        }

        Some(Arc::clone(slot.tenant()))
    }

    /// Change the per-group capacity and rebuild every group under it.
    ///
    /// All workers are stopped and joined, each tenant is collected once, and
    /// new groups are started while every tenant's service lock is held, so no
    /// maintenance call overlaps the cutover.
    pub fn redistribute(&self, max_tenants: usize) -> Result<()> {
        let config = self.config().with_max_tenants(max_tenants);
        config.validate()?;

        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(Error::Disposed("worker pool".into()));
        }
        *self.config.write() = config;

        let before = inner.membership.len();
        let mut slots: Vec<Arc<TenantSlot>> = Vec::with_capacity(before);
        for worker in std::mem::take(&mut inner.workers) {
            slots.extend(worker.drain());
        }

        let mut seen = FxHashMap::default();
        slots.retain(|slot| seen.insert(slot.key().to_string(), ()).is_none());
        if slots.len() != before {
            warn!(expected = before, collected = slots.len(), "membership drifted before redistribution");
        }

        let guards: Vec<_> = slots.iter().map(|slot| slot.hold()).collect();

        inner.membership.clear();
        let mut started = Ok(());
        for chunk in slots.chunks(config.max_tenants()) {
            let id = inner.allocate_id();
            for slot in chunk {
                inner.membership.insert(slot.key().to_string(), id);
            }
            let mut worker = Worker::new(id, config, chunk.to_vec());
            if let Err(err) = worker.start() {
                warn!(group = %id, error = %err, "failed to start worker");
                if started.is_ok() {
                    started = Err(err);
                }
            }
            inner.workers.push(worker);
        }

        drop(guards);
        info!(
            tenants = slots.len(),
            groups = inner.workers.len(),
            max_tenants = config.max_tenants(),
            "tenants redistributed"
        );
        started
    }

    /// Tenant count of each group, in creation order
    pub fn group_sizes(&self) -> Vec<usize> {
        self.inner.lock().workers.iter().map(Worker::len).collect()
    }

    /// Snapshot of every group
    pub fn groups(&self) -> Vec<GroupInfo> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|worker| GroupInfo {
                id: worker.id(),
                tenants: worker.keys(),
                cycles: worker.cycles(),
                faults: worker.faults(),
                priority: worker.applied_priority(),
            })
            .collect()
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.iter().filter(|w| w.is_running()).count()
    }

    /// Number of registered tenants
    pub fn len(&self) -> usize {
        self.inner.lock().membership.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().membership.contains_key(key)
    }

    /// Group currently serving `key`
    pub fn group_of(&self, key: &str) -> Option<GroupId> {
        self.inner.lock().membership.get(key).copied()
    }

    /// Stop every worker. Later registrations fail with `Disposed`.
    pub fn shutdown(&self) {
        let workers = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.membership.clear();
            std::mem::take(&mut inner.workers)
        };

        let count = workers.len();
        for mut worker in workers {
            worker.stop();
        }
        info!(workers = count, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config())
            .field("group_sizes", &self.group_sizes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Stub {
        key: String,
        calls: AtomicU64,
    }

    impl Tenant for Stub {
        fn key(&self) -> &str {
            &self.key
        }

        fn maintain(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn stub(key: &str) -> Arc<Stub> {
        Arc::new(Stub {
            key: key.into(),
            calls: AtomicU64::new(0),
        })
    }

    fn pool(max_tenants: usize) -> WorkerPool {
        WorkerPool::new(DistributorConfig::default().with_max_tenants(max_tenants)).unwrap()
    }

    #[test]
    fn test_register_fills_groups_first_fit() {
        let pool = pool(3);
        for i in 0..7 {
            assert!(pool.register(stub(&format!("s{i}"))).unwrap());
        }
        assert_eq!(pool.group_sizes(), vec![3, 3, 1]);
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(pool.len(), 7);
    }

    #[test]
    fn test_register_twice_is_noop() {
        let pool = pool(2);
        let tenant = stub("dup");
        assert!(pool.register(tenant.clone()).unwrap());
        assert!(!pool.register(tenant).unwrap());
        assert_eq!(pool.group_sizes(), vec![1]);
    }

    #[test]
    fn test_unregister_reuses_freed_capacity() {
        let pool = pool(2);
        for key in ["a", "b", "c"] {
            pool.register(stub(key)).unwrap();
        }
        let first = pool.group_of("a").unwrap();
        assert!(pool.unregister("a").is_some());
        assert!(pool.unregister("a").is_none());

        pool.register(stub("d")).unwrap();
        assert_eq!(pool.group_of("d"), Some(first));
        assert_eq!(pool.group_sizes(), vec![2, 1]);
    }

    #[test]
    fn test_empty_group_is_destroyed() {
        let pool = pool(1);
        pool.register(stub("a")).unwrap();
        pool.register(stub("b")).unwrap();
        assert_eq!(pool.worker_count(), 2);

        pool.unregister("a");
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.group_sizes(), vec![1]);
    }

    #[test]
    fn test_redistribute_keeps_every_tenant_once() {
        let pool = pool(4);
        for i in 0..10 {
            pool.register(stub(&format!("s{i}"))).unwrap();
        }
        pool.redistribute(3).unwrap();

        assert_eq!(pool.group_sizes(), vec![3, 3, 3, 1]);
        let mut keys: Vec<String> = pool.groups().into_iter().flat_map(|g| g.tenants).collect();
        keys.sort();
        let mut expected: Vec<String> = (0..10).map(|i| format!("s{i}")).collect();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(pool.config().max_tenants(), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(WorkerPool::new(DistributorConfig::default().with_max_tenants(0)).is_err());
        let pool = pool(2);
        assert!(matches!(pool.redistribute(256), Err(Error::Config(_))));
        assert_eq!(pool.config().max_tenants(), 2);
    }

    #[test]
    fn test_register_after_shutdown_fails() {
        let pool = pool(2);
        pool.register(stub("a")).unwrap();
        pool.shutdown();
        assert!(pool.is_empty());
        assert!(matches!(pool.register(stub("b")), Err(Error::Disposed(_))));
    }

    #[test]
    fn test_redistribute_after_shutdown_keeps_config() {
        let pool = pool(2);
        pool.shutdown();
        assert!(matches!(pool.redistribute(5), Err(Error::Disposed(_))));
        assert_eq!(pool.config().max_tenants(), 2);
    }

    #[test]
    fn test_groups_report_applied_priority() {
        let pool = pool(2);
        pool.register(stub("a")).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while pool.groups()[0].priority.is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(pool.groups()[0].priority, Some(WorkerPriority::Normal));
        pool.shutdown();
    }
}
