//! Bounded worker pool that drives per-symbol maintenance.
//!
//! Instead of one thread per symbol, a [`WorkerPool`] packs registered
//! [`Tenant`]s into groups of at most `max_tenants`, each group served by one
//! background thread. Every cycle a worker calls [`Tenant::maintain`] on each
//! of its tenants, then idle-sleeps every `sleep_divisor` cycles.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use book_sync::config::DistributorConfig;
//! use book_sync::distributor::{Tenant, WorkerPool};
//!
//! struct Heartbeat(String);
//!
//! impl Tenant for Heartbeat {
//!     fn key(&self) -> &str {
//!         &self.0
//!     }
//!
//!     fn maintain(&self) -> book_sync::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let pool = WorkerPool::new(DistributorConfig::default().with_max_tenants(2)).unwrap();
//! for name in ["a", "b", "c"] {
//!     pool.register(Arc::new(Heartbeat(name.into()))).unwrap();
//! }
//! assert_eq!(pool.group_sizes(), vec![2, 1]);
//! pool.shutdown();
//! ```

mod pool;
mod worker;

pub use pool::{GroupInfo, WorkerPool};
pub use worker::GroupId;

use crate::Result;

/// Unit of work a pool worker services every cycle.
///
/// `maintain` runs on a pool thread and must not block on I/O; anything slow
/// belongs on the async runtime.
pub trait Tenant: Send + Sync {
    /// Stable identity; registering a second tenant with the same key is a no-op
    fn key(&self) -> &str;

    /// One maintenance step
    fn maintain(&self) -> Result<()>;

    /// Disposed tenants are skipped until they are unregistered
    fn is_disposed(&self) -> bool {
        false
    }
}
