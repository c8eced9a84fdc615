//! Book manager for many symbols fed by one stream.
//!
//! This module provides [`BookManager`], the consumer-facing entry point. It
//! owns one [`Observation`] per subscribed symbol, registers each with a
//! shared [`WorkerPool`], and routes feed messages to the right observation.
//!
//! # Lifecycle
//!
//! `subscribe` creates the observation and hands it to the pool, whose workers
//! trigger calibration once the buffering window has passed. `unsubscribe`
//! removes it from routing, waits for its worker to let go, then disposes it.
//! A reconnect of the feed invalidates every book, so
//! [`handle_reconnect`](BookManager::handle_reconnect) resets them all.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CalibrationConfig;
use crate::distributor::WorkerPool;
use crate::error::Error;
use crate::events::{BookEvent, EventSender, ResetReason};
use crate::observation::{Calibration, Ingest, Observation, ObservationStatus};
use crate::provider::SnapshotProvider;
use crate::types::{Diff, FeedMessage, Snapshot};
use crate::Result;

use super::BookView;

/// Manager for the books of many symbols.
///
/// Safe to share across threads via `Arc<BookManager>`. The symbol table is
/// behind a `RwLock`; each book is guarded by its observation's own lock.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use book_sync::client::RestSnapshotProvider;
/// use book_sync::config::{CalibrationConfig, DistributorConfig, FeedConfig};
/// use book_sync::distributor::WorkerPool;
/// use book_sync::orderbook::BookManager;
///
/// # async fn example() -> book_sync::Result<()> {
/// let feed = FeedConfig::new("https://api.example.com/v1/", "wss://stream.example.com/ws");
/// let provider = Arc::new(RestSnapshotProvider::new(&feed)?);
/// let pool = Arc::new(WorkerPool::new(DistributorConfig::default())?);
/// let manager = BookManager::new(provider, pool, CalibrationConfig::default())?;
///
/// manager.subscribe("BTC-USD")?;
///
/// // In your feed loop:
/// // manager.process_message(&message)?;
///
/// if let Some(view) = manager.latest_view("BTC-USD") {
///     println!("best bid: {:?}", view.best_bid());
/// }
/// # Ok(())
/// # }
/// ```
pub struct BookManager {
    books: RwLock<FxHashMap<String, Arc<Observation>>>,
    pool: Arc<WorkerPool>,
    provider: Arc<dyn SnapshotProvider>,
    config: CalibrationConfig,
    events: EventSender,
    runtime: Handle,
}

impl BookManager {
    /// Create a manager that spawns snapshot fetches on the current runtime.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when called outside a Tokio runtime.
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        pool: Arc<WorkerPool>,
        config: CalibrationConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_runtime(provider, pool, config, runtime))
    }

    /// Create a manager that spawns snapshot fetches on `runtime`
    pub fn with_runtime(
        provider: Arc<dyn SnapshotProvider>,
        pool: Arc<WorkerPool>,
        config: CalibrationConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            books: RwLock::new(FxHashMap::default()),
            pool,
            provider,
            config,
            events: EventSender::default(),
            runtime,
        }
    }

    /// Start tracking a symbol.
    ///
    /// Returns the existing observation if the symbol is already tracked.
    ///
    /// # Errors
    ///
    /// Fails if the pool is shut down or cannot start a worker.
    pub fn subscribe(&self, symbol: impl Into<String>) -> Result<Arc<Observation>> {
        let symbol = symbol.into();
        let mut books = self.books.write();
        if let Some(existing) = books.get(&symbol) {
            return Ok(Arc::clone(existing));
        }

        let observation = Observation::new(
            symbol.clone(),
            Arc::clone(&self.provider),
            self.config.clone(),
            self.events.clone(),
            self.runtime.clone(),
        );

        if let Err(err) = self.pool.register(observation.clone()) {
            observation.dispose();
            return Err(err);
        }

        info!(symbol = %symbol, "subscribed");
        books.insert(symbol, Arc::clone(&observation));
        Ok(observation)
    }

    /// Stop tracking a symbol.
    ///
    /// Routing stops first, then the pool releases the observation, then it
    /// is disposed. Returns `false` if the symbol was not tracked.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let Some(observation) = self.books.write().remove(symbol) else {
            return false;
        };
        self.pool.unregister(symbol);
        observation.dispose();
        info!(symbol = %symbol, "unsubscribed");
        true
    }

    /// Route one diff to its observation.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSymbol`] if the symbol is not tracked, otherwise
    /// whatever [`Observation::on_next`] rejects.
    pub fn on_diff(&self, diff: Diff) -> Result<Ingest> {
        let observation = self.observation(&diff.symbol).ok_or_else(|| {
            warn!(symbol = %diff.symbol, sequence = diff.sequence, "diff for untracked symbol");
            Error::UnknownSymbol(diff.symbol.clone())
        })?;
        observation.on_next(diff)
    }

    /// Reconcile a snapshot pushed over the stream.
    ///
    /// A calibration already in flight wins; the pushed snapshot is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSymbol`] if the symbol is not tracked, otherwise
    /// whatever [`Observation::calibrate_with`] returns.
    pub fn on_snapshot(&self, snapshot: &Snapshot) -> Result<Option<Calibration>> {
        let observation = self
            .observation(&snapshot.symbol)
            .ok_or_else(|| Error::UnknownSymbol(snapshot.symbol.clone()))?;
        match observation.calibrate_with(snapshot) {
            Ok(calibration) => Ok(Some(calibration)),
            Err(Error::CalibrationInProgress(symbol)) => {
                debug!(symbol = %symbol, "pushed snapshot ignored; fetch in flight");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Process a feed message
    ///
    /// Routes diffs and snapshots to the matching observation. Returns the
    /// symbol whose book was touched.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(symbol))` - A book consumed the message
    /// - `Ok(None)` - Not a book message, or the symbol is not tracked
    /// - `Err(_)` - The observation rejected the message
    pub fn process_message(&self, message: &FeedMessage) -> Result<Option<String>> {
        match message {
            FeedMessage::Diff(diff) => {
                if !self.contains(&diff.symbol) {
                    return Ok(None);
                }
                self.on_diff(diff.clone())?;
                Ok(Some(diff.symbol.clone()))
            }
            FeedMessage::Snapshot(snapshot) => {
                if !self.contains(&snapshot.symbol) {
                    return Ok(None);
                }
                self.on_snapshot(snapshot)?;
                Ok(Some(snapshot.symbol.clone()))
            }
            FeedMessage::Error(err) => {
                warn!(code = err.code, message = %err.message, "feed error");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Observation tracking `symbol`
    pub fn observation(&self, symbol: &str) -> Option<Arc<Observation>> {
        self.books.read().get(symbol).cloned()
    }

    /// Whether `symbol` is tracked
    pub fn contains(&self, symbol: &str) -> bool {
        self.books.read().contains_key(symbol)
    }

    /// Top-`depth` view of a book, taken under its lock.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSymbol`] if the symbol is not tracked.
    pub fn view(&self, symbol: &str, depth: usize) -> Result<BookView> {
        self.observation(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?
            .materialize_view(depth)
    }

    /// View cached by the last maintenance cycle
    pub fn latest_view(&self, symbol: &str) -> Option<BookView> {
        self.observation(symbol)?.latest_view()
    }

    /// Flags of one observation
    pub fn status(&self, symbol: &str) -> Option<ObservationStatus> {
        self.observation(symbol).map(|o| o.status())
    }

    /// Receiver for calibration, reset and failure notifications
    pub fn events(&self) -> broadcast::Receiver<BookEvent> {
        self.events.subscribe()
    }

    /// Reset one book.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSymbol`] if the symbol is not tracked.
    pub fn reset(&self, symbol: &str) -> Result<()> {
        self.observation(symbol)
            .ok_or_else(|| Error::UnknownSymbol(symbol.to_string()))?
            .reset()
    }

    /// Reset every book after the feed reconnected
    pub fn handle_reconnect(&self) {
        let observations: Vec<_> = self.books.read().values().cloned().collect();
        info!(books = observations.len(), "feed reconnected; resetting books");
        for observation in observations {
            if let Err(err) = observation.reset_with(ResetReason::Reconnect) {
                debug!(symbol = %observation.symbol(), error = %err, "reset skipped");
            }
        }
    }

    /// All tracked symbols
    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }

    /// Symbols whose book is not calibrated yet
    pub fn markets_needing_calibration(&self) -> Vec<String> {
        self.books
            .read()
            .iter()
            .filter(|(_, o)| !o.is_calibrated())
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Symbols that exhausted their snapshot retries
    pub fn failed_symbols(&self) -> Vec<String> {
        self.books
            .read()
            .iter()
            .filter(|(_, o)| o.has_failed())
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    /// Pool servicing this manager's observations
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Get number of tracked symbols
    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    /// Check if manager tracks nothing
    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }

    /// Unsubscribe every symbol
    pub fn clear(&self) {
        for symbol in self.symbols() {
            self.unsubscribe(&symbol);
        }
    }
}

impl Drop for BookManager {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for BookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookManager")
            .field("symbols", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}
