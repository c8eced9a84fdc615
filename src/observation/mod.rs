//! Per-symbol calibration and update protocol.
//!
//! An [`Observation`] owns one symbol's [`OrderBook`] and reconciles two
//! inputs that are not aligned in time:
//!
//! - a stream of incremental [`Diff`]s, delivered in order by the feed, and
//! - an authoritative [`Snapshot`] fetched on demand.
//!
//! # Protocol
//!
//! ```text
//!   Buffering ──(window elapsed)──▶ Calibrating ──(snapshot ok)──▶ Running
//!       ▲                                │                            │
//!       └────── retries exhausted ───────┘                            │
//!       └──────────── reset (gap, corruption, reconnect, caller) ─────┘
//! ```
//!
//! Until a snapshot has been reconciled every diff is buffered. Once the
//! snapshot arrives the buffer is replayed in sequence order on top of it,
//! skipping diffs the snapshot already covers, and later diffs apply
//! directly. A diff at or below the book sequence is always a no-op, so
//! duplicate delivery and replay overlap are harmless.
//!
//! # Threading
//!
//! Every read and write goes through one `parking_lot::Mutex`. The only
//! suspension point, the snapshot fetch, runs as a Tokio task and takes the
//! lock again just to install its result; [`Observation::maintain`] never
//! waits on the network.

mod state;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::CalibrationConfig;
use crate::distributor::Tenant;
use crate::error::Error;
use crate::events::{BookEvent, EventSender, ResetReason};
use crate::orderbook::{BookView, OrderBook};
use crate::provider::SnapshotProvider;
use crate::types::{Diff, Sequence, Snapshot};
use crate::Result;

pub use state::{Calibration, Ingest, ObservationStatus, Phase};

use state::State;

/// Order book of one symbol plus its calibration state machine.
///
/// Created behind an `Arc` so maintenance can hand the snapshot fetch to the
/// runtime as an owned task.
pub struct Observation {
    symbol: String,
    state: Mutex<State>,
    provider: Arc<dyn SnapshotProvider>,
    config: CalibrationConfig,
    events: EventSender,
    runtime: Handle,
    me: Weak<Observation>,
}

impl std::fmt::Debug for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observation")
            .field("symbol", &self.symbol)
            .field("status", &self.status())
            .finish()
    }
}

impl Observation {
    /// Create an observation in the `Buffering` phase.
    ///
    /// Snapshot fetches are spawned on `runtime`; events go to `events`.
    pub fn new(
        symbol: impl Into<String>,
        provider: Arc<dyn SnapshotProvider>,
        config: CalibrationConfig,
        events: EventSender,
        runtime: Handle,
    ) -> Arc<Self> {
        let symbol = symbol.into();
        Arc::new_cyclic(|me| Self {
            symbol,
            state: Mutex::new(State::new()),
            provider,
            config,
            events,
            runtime,
            me: me.clone(),
        })
    }

    /// Symbol this observation tracks
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Calibration settings
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Copy of the current flags
    pub fn status(&self) -> ObservationStatus {
        self.state.lock().status()
    }

    /// Current protocol phase
    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Whether live diffs apply directly
    pub fn is_calibrated(&self) -> bool {
        self.state.lock().calibrated
    }

    /// Whether snapshot retries were exhausted since the last [`reset`](Self::reset)
    pub fn has_failed(&self) -> bool {
        self.state.lock().failure
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Successful calibrations so far
    pub fn reset_count(&self) -> u32 {
        self.state.lock().reset_count
    }

    /// Book sequence
    pub fn sequence(&self) -> Sequence {
        self.state.lock().book.sequence()
    }

    /// Ingest one diff from the feed.
    ///
    /// Before calibration the diff is buffered; afterwards it is applied. A
    /// diff for another symbol, with a non-positive price or a negative size
    /// is rejected and logged without touching the book. Corruption found
    /// while applying resets the observation instead of failing the call.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownSymbol`] or [`Error::InvalidDiff`] for rejected diffs,
    /// [`Error::Disposed`] after teardown.
    pub fn on_next(&self, diff: Diff) -> Result<Ingest> {
        if let Err(err) = self.validate(&diff) {
            warn!(symbol = %self.symbol, sequence = diff.sequence, error = %err, "diff rejected");
            return Err(err);
        }

        let outcome = {
            let mut state = self.state.lock();
            state.ensure_live(&self.symbol)?;
            state.ingest(&self.symbol, diff, &self.config)?
        };

        if let Ingest::Reset(reason) = &outcome {
            self.events.emit(BookEvent::Reset {
                symbol: self.symbol.clone(),
                reason: reason.clone(),
            });
        }
        Ok(outcome)
    }

    fn validate(&self, diff: &Diff) -> Result<()> {
        if diff.symbol != self.symbol {
            return Err(Error::UnknownSymbol(diff.symbol.clone()));
        }
        if diff.price.is_sign_negative() || diff.price.is_zero() {
            return Err(Error::InvalidDiff(format!(
                "non-positive price {}",
                diff.price
            )));
        }
        if diff.size.is_sign_negative() && !diff.size.is_zero() {
            return Err(Error::InvalidDiff(format!("negative size {}", diff.size)));
        }
        Ok(())
    }

    /// Fetch a snapshot and reconcile it with the buffered diffs.
    ///
    /// Failed fetches are retried `max_timeout_retries` times with
    /// `reset_timeout` between attempts, each bounded by `request_timeout`.
    /// When the retries run out the observation is marked failed and is not
    /// calibrated again automatically until [`reset`](Self::reset).
    /// Calibrating an already running book resets it first.
    ///
    /// # Errors
    ///
    /// - [`Error::CalibrationInProgress`] if another calibration is running
    /// - [`Error::Superseded`] if a reset happened during the fetch
    /// - [`Error::CalibrationFailed`] when retries are exhausted
    /// - [`Error::Disposed`] after teardown
    pub async fn calibrate(&self) -> Result<Calibration> {
        let epoch = self.begin()?;
        self.run_calibration(epoch).await
    }

    /// Reconcile a snapshot obtained elsewhere (for example pushed over the
    /// stream) with the buffered diffs, without fetching.
    ///
    /// # Errors
    ///
    /// Same as [`calibrate`](Self::calibrate), plus [`Error::UnknownSymbol`]
    /// or [`Error::DuplicateKey`] for an unusable snapshot.
    pub fn calibrate_with(&self, snapshot: &Snapshot) -> Result<Calibration> {
        let epoch = self.begin()?;
        let result = {
            let mut state = self.state.lock();
            let result =
                state.reconcile(&self.symbol, epoch, snapshot, self.config.view_depth());
            if result.is_err() {
                state.abandon(epoch);
            }
            result
        };
        if let Ok(calibration) = &result {
            self.announce(calibration);
        }
        result
    }

    fn begin(&self) -> Result<u64> {
        let (epoch, was_running) = {
            let mut state = self.state.lock();
            let was_running = state.phase == Phase::Running;
            (state.begin_calibration(&self.symbol)?, was_running)
        };
        if was_running {
            self.events.emit(BookEvent::Reset {
                symbol: self.symbol.clone(),
                reason: ResetReason::Requested,
            });
        }
        Ok(epoch)
    }

    async fn run_calibration(&self, epoch: u64) -> Result<Calibration> {
        let max_attempts = self.config.max_timeout_retries().saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let fetched = match tokio::time::timeout(
                self.config.request_timeout(),
                self.provider.fetch_snapshot(&self.symbol),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };

            let result = fetched.and_then(|snapshot| {
                let mut state = self.state.lock();
                state.reconcile(&self.symbol, epoch, &snapshot, self.config.view_depth())
            });

            let err = match result {
                Ok(calibration) => {
                    self.announce(&calibration);
                    return Ok(calibration);
                }
                Err(err @ (Error::Superseded(_) | Error::Disposed(_))) => {
                    debug!(symbol = %self.symbol, error = %err, "calibration abandoned");
                    return Err(err);
                }
                Err(err) => err,
            };

            let retryable = err.is_transient() || err.is_corruption();
            if retryable && attempt < max_attempts {
                warn!(
                    symbol = %self.symbol,
                    attempt,
                    max_attempts,
                    error = %err,
                    "snapshot fetch failed; retrying"
                );
                tokio::time::sleep(self.config.reset_timeout()).await;
                if !self.state.lock().is_current(epoch) {
                    return Err(Error::Superseded(self.symbol.clone()));
                }
                continue;
            }

            if self.state.lock().fail(epoch) {
                error!(
                    symbol = %self.symbol,
                    attempts = attempt,
                    error = %err,
                    "calibration failed; waiting for reset"
                );
                self.events.emit(BookEvent::Failed {
                    symbol: self.symbol.clone(),
                    attempts: attempt,
                });
            }
            return Err(Error::CalibrationFailed {
                symbol: self.symbol.clone(),
                attempts: attempt,
            });
        }
    }

    fn announce(&self, calibration: &Calibration) {
        info!(
            symbol = %self.symbol,
            snapshot_sequence = calibration.snapshot_sequence,
            sequence = calibration.sequence,
            replayed = calibration.replayed,
            skipped = calibration.skipped,
            levels = calibration.levels,
            "book calibrated"
        );
        self.events.emit(BookEvent::Calibrated {
            symbol: self.symbol.clone(),
            sequence: calibration.sequence,
            levels: calibration.levels,
            replayed: calibration.replayed,
        });
    }

    /// Discard the book and buffer and go back to buffering.
    ///
    /// Clears the failure flag, so automatic calibration resumes. Any fetch in
    /// flight is superseded and its result dropped.
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after teardown.
    pub fn reset(&self) -> Result<()> {
        self.reset_with(ResetReason::Requested)
    }

    /// Reset, recording why
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after teardown.
    pub fn reset_with(&self, reason: ResetReason) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.ensure_live(&self.symbol)?;
            state.reset();
        }
        info!(symbol = %self.symbol, ?reason, "book reset");
        self.events.emit(BookEvent::Reset {
            symbol: self.symbol.clone(),
            reason,
        });
        Ok(())
    }

    /// Top-`depth` copy of the book, taken under the lock.
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after teardown.
    pub fn materialize_view(&self, depth: usize) -> Result<BookView> {
        let state = self.state.lock();
        state.ensure_live(&self.symbol)?;
        Ok(state.book.view(&self.symbol, depth))
    }

    /// View cached by the last maintenance cycle while running
    pub fn latest_view(&self) -> Option<BookView> {
        self.state.lock().latest_view.clone()
    }

    /// Full copy of the book
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after teardown.
    pub fn book(&self) -> Result<OrderBook> {
        let state = self.state.lock();
        state.ensure_live(&self.symbol)?;
        Ok(state.book.clone())
    }

    /// One maintenance step, driven by a pool worker.
    ///
    /// While running it refreshes the cached view. While buffering, once the
    /// buffering window has elapsed and no failure is pending, it starts a
    /// calibration on the runtime and returns immediately.
    ///
    /// # Errors
    ///
    /// [`Error::Disposed`] after teardown.
    pub fn maintain(&self) -> Result<()> {
        let epoch = {
            let mut state = self.state.lock();
            state.ensure_live(&self.symbol)?;
            match state.phase {
                Phase::Running => {
                    let view = state.book.view(&self.symbol, self.config.view_depth());
                    state.latest_view = Some(view);
                    None
                }
                Phase::Buffering
                    if !state.failure
                        && state.buffering_since.elapsed() >= self.config.buffering_window() =>
                {
                    Some(state.begin_calibration(&self.symbol)?)
                }
                _ => None,
            }
        };

        if let Some(epoch) = epoch {
            self.spawn_calibration(epoch);
        }
        Ok(())
    }

    fn spawn_calibration(&self, epoch: u64) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        debug!(symbol = %self.symbol, epoch, "dispatching snapshot fetch");
        self.runtime.spawn(async move {
            match this.run_calibration(epoch).await {
                Ok(_) | Err(Error::Superseded(_)) | Err(Error::Disposed(_)) => {}
                Err(err) => debug!(symbol = %this.symbol, error = %err, "background calibration ended"),
            }
        });
    }

    /// Tear the observation down.
    ///
    /// Once this returns no diff is applied and every later operation fails
    /// with [`Error::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.epoch += 1;
        state.pending.clear();
        state.book = OrderBook::new();
        state.latest_view = None;
        debug!(symbol = %self.symbol, "observation disposed");
    }
}

impl Tenant for Observation {
    fn key(&self) -> &str {
        &self.symbol
    }

    fn maintain(&self) -> Result<()> {
        Observation::maintain(self)
    }

    fn is_disposed(&self) -> bool {
        Observation::is_disposed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use futures_util::future::BoxFuture;
    use rust_decimal_macros::dec;

    struct FixedProvider(Snapshot);

    impl SnapshotProvider for FixedProvider {
        fn fetch_snapshot(&self, _symbol: &str) -> BoxFuture<'static, Result<Snapshot>> {
            let snapshot = self.0.clone();
            Box::pin(async move { Ok(snapshot) })
        }
    }

    fn observation(snapshot: Snapshot) -> Arc<Observation> {
        Observation::new(
            "ETH-USD",
            Arc::new(FixedProvider(snapshot)),
            CalibrationConfig::default(),
            EventSender::default(),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_rejects_foreign_and_malformed_diffs() {
        let obs = observation(Snapshot::new("ETH-USD", 1));

        let err = obs
            .on_next(Diff::new("BTC-USD", Side::Ask, dec!(1), dec!(1), 1))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSymbol(_)));

        let err = obs
            .on_next(Diff::new("ETH-USD", Side::Ask, dec!(0), dec!(1), 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDiff(_)));

        let err = obs
            .on_next(Diff::new("ETH-USD", Side::Ask, dec!(1), dec!(-1), 1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDiff(_)));

        assert_eq!(obs.status().pending, 0);
        assert!(!obs.status().initialized);
    }

    #[tokio::test]
    async fn test_calibrate_then_live() {
        let obs = observation(Snapshot::new("ETH-USD", 10).with_ask(dec!(5), dec!(1)));
        obs.on_next(Diff::new("ETH-USD", Side::Ask, dec!(5), dec!(2), 11))
            .unwrap();

        let cal = obs.calibrate().await.unwrap();
        assert_eq!(cal.replayed, 1);
        assert!(obs.is_calibrated());
        assert_eq!(obs.reset_count(), 1);

        let out = obs
            .on_next(Diff::new("ETH-USD", Side::Ask, dec!(5), dec!(0), 12))
            .unwrap();
        assert!(matches!(out, Ingest::Applied(crate::orderbook::LevelChange::Removed)));
        assert!(obs.materialize_view(5).unwrap().asks.is_empty());
    }

    #[tokio::test]
    async fn test_disposed_fails_fast() {
        let obs = observation(Snapshot::new("ETH-USD", 1));
        obs.dispose();
        obs.dispose();

        assert!(matches!(
            obs.on_next(Diff::new("ETH-USD", Side::Bid, dec!(1), dec!(1), 1)),
            Err(Error::Disposed(_))
        ));
        assert!(matches!(obs.maintain(), Err(Error::Disposed(_))));
        assert!(matches!(obs.calibrate().await, Err(Error::Disposed(_))));
        assert!(obs.materialize_view(1).is_err());
    }
}
