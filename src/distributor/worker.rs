//! One background worker thread and the tenants it serves.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::config::{DistributorConfig, WorkerPriority};
use crate::error::Error;

use super::Tenant;

/// Identity of a tenant group and its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A registered tenant plus the lock held for the duration of each
/// maintenance call.
pub(crate) struct TenantSlot {
    tenant: Arc<dyn Tenant>,
    service: Mutex<()>,
    retired: AtomicBool,
}

impl TenantSlot {
    pub(crate) fn new(tenant: Arc<dyn Tenant>) -> Self {
        Self {
            tenant,
            service: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &str {
        self.tenant.key()
    }

    pub(crate) fn tenant(&self) -> &Arc<dyn Tenant> {
        &self.tenant
    }

    /// Hold off maintenance of this tenant until the guard drops
    pub(crate) fn hold(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.service.lock()
    }

    /// Wait out any in-flight maintenance call and refuse all later ones.
    ///
    /// A worker may still hold this slot in the tenant list it cloned at the
    /// start of its cycle, so removal from the list alone is not enough.
    pub(crate) fn retire(&self) {
        let _guard = self.service.lock();
        self.retired.store(true, Ordering::Release);
    }

    /// Run one maintenance step. Errors and panics are logged, never raised.
    fn service(&self, group: GroupId, stats: &WorkerStats) {
        let _guard = self.service.lock();
        if self.retired.load(Ordering::Acquire) || self.tenant.is_disposed() {
            return;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.tenant.maintain())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                stats.faults.fetch_add(1, Ordering::Relaxed);
                warn!(%group, tenant = %self.key(), error = %err, "tenant maintenance failed");
            }
            Err(payload) => {
                stats.faults.fetch_add(1, Ordering::Relaxed);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(%group, tenant = %self.key(), panic = %message, "tenant maintenance panicked");
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    pub(crate) cycles: AtomicU64,
    pub(crate) faults: AtomicU64,
}

/// Tenants served by one worker
type Roster = Arc<[Arc<TenantSlot>]>;

struct Shared {
    /// Replaced wholesale on change; a cycle clones the `Arc` only
    tenants: RwLock<Roster>,
    running: AtomicBool,
    stats: WorkerStats,
    /// Priority the thread managed to apply to itself
    applied: Mutex<Option<WorkerPriority>>,
}

/// A tenant group and the thread serving it.
pub(crate) struct Worker {
    id: GroupId,
    config: DistributorConfig,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a group holding `tenants`; the thread starts with [`start`](Self::start)
    pub(crate) fn new(id: GroupId, config: DistributorConfig, tenants: Vec<Arc<TenantSlot>>) -> Self {
        Self {
            id,
            config,
            shared: Arc::new(Shared {
                tenants: RwLock::new(tenants.into()),
                running: AtomicBool::new(false),
                stats: WorkerStats::default(),
                applied: Mutex::new(None),
            }),
            handle: None,
        }
    }

    pub(crate) fn start(&mut self) -> Result<(), Error> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let (id, config) = (self.id, self.config);
        let spawned = thread::Builder::new()
            .name(format!("book-worker-{}-{}", config.priority().tag(), id.0))
            .spawn(move || run(id, config, &shared));

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                debug!(group = %self.id, priority = ?config.priority(), "worker started");
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Io(err))
            }
        }
    }

    /// Signal the thread and wait for its current cycle to finish
    pub(crate) fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!(group = %self.id, "worker thread panicked");
            }
            debug!(group = %self.id, "worker stopped");
        }
    }

    /// Stop the thread and hand back every tenant
    pub(crate) fn drain(mut self) -> Vec<Arc<TenantSlot>> {
        self.stop();
        let roster = std::mem::replace(&mut *self.shared.tenants.write(), Arc::from(Vec::new()));
        roster.to_vec()
    }

    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.tenants.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.shared.tenants.read().is_empty()
    }

    pub(crate) fn push(&self, slot: Arc<TenantSlot>) {
        let mut roster = self.shared.tenants.write();
        let mut tenants = roster.to_vec();
        tenants.push(slot);
        *roster = tenants.into();
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<TenantSlot>> {
        let mut roster = self.shared.tenants.write();
        let index = roster.iter().position(|slot| slot.key() == key)?;
        let mut tenants = roster.to_vec();
        let slot = tenants.remove(index);
        *roster = tenants.into();
        Some(slot)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.shared
            .tenants
            .read()
            .iter()
            .map(|slot| slot.key().to_string())
            .collect()
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.shared.stats.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn faults(&self) -> u64 {
        self.shared.stats.faults.load(Ordering::Relaxed)
    }

    /// Priority in effect on the thread; `None` before it starts or if the
    /// OS refused it
    pub(crate) fn applied_priority(&self) -> Option<WorkerPriority> {
        *self.shared.applied.lock()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(id: GroupId, config: DistributorConfig, shared: &Shared) {
    let priority = config.priority();
    match apply_priority(priority) {
        Ok(()) => *shared.applied.lock() = Some(priority),
        Err(err) => warn!(group = %id, ?priority, error = %err, "worker priority not applied"),
    }

    let idle = config.idle_sleep();
    let mut cycle: u64 = 0;

    while shared.running.load(Ordering::Acquire) {
        let tenants = Arc::clone(&*shared.tenants.read());
        for slot in tenants.iter() {
            slot.service(id, &shared.stats);
        }

        cycle += 1;
        shared.stats.cycles.fetch_add(1, Ordering::Relaxed);

        if config.sleeps_after(cycle) {
            if idle.is_zero() {
                thread::yield_now();
            } else {
                // unparked early by stop()
                thread::park_timeout(idle);
            }
        }
    }
}

/// Set the calling thread's nice value
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn apply_priority(priority: WorkerPriority) -> io::Result<()> {
    let Some(nice) = priority.nice() else {
        return Ok(());
    };
    // SAFETY: both calls only read or change the calling thread's scheduling state
    let result = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(priority: WorkerPriority) -> io::Result<()> {
    match priority.nice() {
        None => Ok(()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "per-thread priority needs Linux",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct Counter {
        key: String,
        calls: AtomicU64,
        fail: bool,
    }

    impl Tenant for Counter {
        fn key(&self) -> &str {
            &self.key
        }

        fn maintain(&self) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(Error::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn counter(key: &str, fail: bool) -> Arc<Counter> {
        Arc::new(Counter {
            key: key.into(),
            calls: AtomicU64::new(0),
            fail,
        })
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_worker_services_all_tenants() {
        let ok = counter("ok", false);
        let bad = counter("bad", true);
        let mut worker = Worker::new(
            GroupId(1),
            DistributorConfig::default(),
            vec![
                Arc::new(TenantSlot::new(bad.clone())),
                Arc::new(TenantSlot::new(ok.clone())),
            ],
        );
        worker.start().unwrap();

        assert!(wait_for(|| ok.calls.load(Ordering::Relaxed) >= 3));
        assert!(worker.faults() >= 1);
        assert!(worker.cycles() >= 1);

        let slots = worker.drain();
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_tenants_added_while_running_are_serviced() {
        let first = counter("first", false);
        let late = counter("late", false);
        let mut worker = Worker::new(
            GroupId(3),
            DistributorConfig::default(),
            vec![Arc::new(TenantSlot::new(first.clone()))],
        );
        worker.start().unwrap();
        assert!(wait_for(|| first.calls.load(Ordering::Relaxed) >= 1));

        worker.push(Arc::new(TenantSlot::new(late.clone())));
        assert!(wait_for(|| late.calls.load(Ordering::Relaxed) >= 3));
        assert_eq!(worker.len(), 2);

        let slot = worker.remove("first").unwrap();
        slot.retire();
        let frozen = first.calls.load(Ordering::Relaxed);
        let seen = late.calls.load(Ordering::Relaxed);
        assert!(wait_for(|| late.calls.load(Ordering::Relaxed) > seen + 2));
        assert_eq!(first.calls.load(Ordering::Relaxed), frozen);
    }

    #[test]
    fn test_normal_priority_is_always_applied() {
        let mut worker = Worker::new(GroupId(4), DistributorConfig::default(), Vec::new());
        assert_eq!(worker.applied_priority(), None);
        worker.start().unwrap();
        assert!(wait_for(|| worker.applied_priority() == Some(WorkerPriority::Normal)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_low_priority_lowers_the_worker_thread() {
        let config = DistributorConfig::default().with_priority(WorkerPriority::Low);
        let mut worker = Worker::new(GroupId(5), config, Vec::new());
        worker.start().unwrap();
        assert!(wait_for(|| worker.applied_priority() == Some(WorkerPriority::Low)));
        assert!(wait_for(|| worker.cycles() >= 2));
    }

    #[test]
    fn test_remove_by_key() {
        let worker = Worker::new(GroupId(2), DistributorConfig::default(), Vec::new());
        worker.push(Arc::new(TenantSlot::new(counter("a", false))));
        worker.push(Arc::new(TenantSlot::new(counter("b", false))));

        let removed = worker.remove("a").unwrap();
        removed.retire();
        assert!(worker.remove("a").is_none());
        assert_eq!(worker.keys(), vec!["b".to_string()]);
        assert!(!worker.is_running());
    }
}
