//! Snapshot provider contract.
//!
//! Calibration needs one capability from the outside world: fetch the
//! authoritative book of a symbol. The returned future is `'static` so it can
//! be spawned onto the runtime without borrowing the provider.

use futures_util::future::BoxFuture;

use crate::types::Snapshot;
use crate::Result;

/// Source of authoritative book snapshots.
///
/// Implementations should fail with [`Error::Network`](crate::Error::Network),
/// [`Error::Timeout`](crate::Error::Timeout) or another transient error when a
/// retry could succeed.
pub trait SnapshotProvider: Send + Sync {
    /// Fetch the current book of `symbol`
    fn fetch_snapshot(&self, symbol: &str) -> BoxFuture<'static, Result<Snapshot>>;
}

impl<P: SnapshotProvider + ?Sized> SnapshotProvider for std::sync::Arc<P> {
    fn fetch_snapshot(&self, symbol: &str) -> BoxFuture<'static, Result<Snapshot>> {
        (**self).fetch_snapshot(symbol)
    }
}
