//! Unsynchronized calibration state of one symbol.
//!
//! [`State`] holds everything the observation lock guards. All methods assume
//! the caller holds that lock; none of them block or await.

use std::time::Instant;

use tracing::{error, trace, warn};

use crate::config::CalibrationConfig;
use crate::error::Error;
use crate::events::ResetReason;
use crate::orderbook::{BookView, DiffOutcome, LevelChange, OrderBook};
use crate::types::{Diff, Sequence, Snapshot};

/// Protocol phase of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No authoritative book; diffs are buffered
    Buffering,
    /// Snapshot fetch in flight; diffs are still buffered
    Calibrating,
    /// Book calibrated; diffs apply directly
    Running,
}

/// Point-in-time copy of an observation's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationStatus {
    /// Protocol phase
    pub phase: Phase,
    /// A snapshot has been reconciled since the last reset
    pub calibrated: bool,
    /// At least one diff has arrived since the last reset
    pub initialized: bool,
    /// Snapshot retries were exhausted; cleared by reset
    pub failure: bool,
    /// Observation has been torn down
    pub disposed: bool,
    /// Successful calibrations so far
    pub reset_count: u32,
    /// Book sequence
    pub sequence: Sequence,
    /// Diffs waiting for calibration
    pub pending: usize,
}

/// What happened to an ingested diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Held until the next calibration
    Buffered,
    /// Applied to the live book
    Applied(LevelChange),
    /// Not newer than the book; ignored
    Stale,
    /// Triggered a reset; the book is buffering again
    Reset(ResetReason),
}

/// Summary of a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// Snapshot sequence
    pub snapshot_sequence: Sequence,
    /// Book sequence after replay
    pub sequence: Sequence,
    /// Buffered diffs applied on top of the snapshot
    pub replayed: usize,
    /// Buffered diffs already covered by the snapshot
    pub skipped: usize,
    /// Levels on both sides after replay
    pub levels: usize,
}

pub(super) struct State {
    pub(super) phase: Phase,
    pub(super) book: OrderBook,
    pub(super) calibrated: bool,
    pub(super) initialized: bool,
    pub(super) failure: bool,
    pub(super) disposed: bool,
    pub(super) reset_count: u32,
    /// Arrival order; sorted by sequence only at replay
    pub(super) pending: Vec<Diff>,
    pub(super) buffering_since: Instant,
    /// Bumped by every reset so in-flight calibrations can tell they are stale
    pub(super) epoch: u64,
    pub(super) latest_view: Option<BookView>,
}

impl State {
    pub(super) fn new() -> Self {
        Self {
            phase: Phase::Buffering,
            book: OrderBook::new(),
            calibrated: false,
            initialized: false,
            failure: false,
            disposed: false,
            reset_count: 0,
            pending: Vec::new(),
            buffering_since: Instant::now(),
            epoch: 0,
            latest_view: None,
        }
    }

    pub(super) fn status(&self) -> ObservationStatus {
        ObservationStatus {
            phase: self.phase,
            calibrated: self.calibrated,
            initialized: self.initialized,
            failure: self.failure,
            disposed: self.disposed,
            reset_count: self.reset_count,
            sequence: self.book.sequence(),
            pending: self.pending.len(),
        }
    }

    pub(super) fn ensure_live(&self, symbol: &str) -> Result<(), Error> {
        if self.disposed {
            Err(Error::Disposed(format!("observation {symbol}")))
        } else {
            Ok(())
        }
    }

    /// Discard the book and buffer and start buffering again.
    ///
    /// `failure` survives; only [`reset`](Self::reset) clears it.
    pub(super) fn rebuffer(&mut self) {
        self.epoch += 1;
        self.phase = Phase::Buffering;
        self.book = OrderBook::new();
        self.pending.clear();
        self.calibrated = false;
        self.initialized = false;
        self.buffering_since = Instant::now();
        self.latest_view = None;
    }

    /// Rebuffer and clear the failure flag so automatic calibration resumes
    pub(super) fn reset(&mut self) {
        self.rebuffer();
        self.failure = false;
    }

    /// Buffer or apply one validated diff
    pub(super) fn ingest(
        &mut self,
        symbol: &str,
        diff: Diff,
        config: &CalibrationConfig,
    ) -> Result<Ingest, Error> {
        self.initialized = true;

        if !self.calibrated {
            self.pending.push(diff);
            if self.pending.len() > config.max_buffered_diffs() {
                warn!(
                    symbol = %symbol,
                    limit = config.max_buffered_diffs(),
                    "pending diff buffer overflowed before calibration"
                );
                self.rebuffer();
                return Ok(Ingest::Reset(ResetReason::BufferOverflow));
            }
            return Ok(Ingest::Buffered);
        }

        if let Some(tolerance) = config.max_sequence_gap() {
            let expected = self.book.sequence().saturating_add(tolerance);
            let got = diff.sequence;
            if got > expected {
                let err = Error::SequenceGap { expected, got };
                warn!(symbol = %symbol, error = %err, "feed discontinuity");
                self.rebuffer();
                // the diff that revealed the gap opens the next buffer
                self.initialized = true;
                self.pending.push(diff);
                return Ok(Ingest::Reset(ResetReason::SequenceGap { expected, got }));
            }
        }

        match self.book.apply_diff(&diff) {
            Ok(DiffOutcome::Applied(change)) => {
                trace!(symbol = %symbol, sequence = diff.sequence, ?change, "diff applied");
                Ok(Ingest::Applied(change))
            }
            Ok(DiffOutcome::Stale) => {
                trace!(
                    symbol = %symbol,
                    sequence = diff.sequence,
                    book_sequence = self.book.sequence(),
                    "stale diff dropped"
                );
                Ok(Ingest::Stale)
            }
            Err(err) if err.is_corruption() => {
                error!(symbol = %symbol, error = %err, "book corrupted; resetting");
                self.rebuffer();
                Ok(Ingest::Reset(ResetReason::Corruption))
            }
            Err(err) => Err(err),
        }
    }

    /// Enter `Calibrating` and return the epoch the fetch belongs to
    pub(super) fn begin_calibration(&mut self, symbol: &str) -> Result<u64, Error> {
        self.ensure_live(symbol)?;
        match self.phase {
            Phase::Calibrating => Err(Error::CalibrationInProgress(symbol.to_string())),
            Phase::Running => {
                // recalibrating a live book starts from a clean buffer
                self.rebuffer();
                self.phase = Phase::Calibrating;
                Ok(self.epoch)
            }
            Phase::Buffering => {
                self.phase = Phase::Calibrating;
                Ok(self.epoch)
            }
        }
    }

    /// Whether a calibration started at `epoch` is still wanted
    pub(super) fn is_current(&self, epoch: u64) -> bool {
        !self.disposed && self.epoch == epoch
    }

    /// Replace the book with `snapshot` and replay the buffer on top of it.
    ///
    /// Buffered diffs are applied in sequence order; those at or below the
    /// snapshot sequence are already reflected in it and are skipped. On error
    /// the buffer is left intact so a later attempt can replay it.
    pub(super) fn reconcile(
        &mut self,
        symbol: &str,
        epoch: u64,
        snapshot: &Snapshot,
        view_depth: usize,
    ) -> Result<Calibration, Error> {
        self.ensure_live(symbol)?;
        if self.epoch != epoch {
            return Err(Error::Superseded(symbol.to_string()));
        }
        if snapshot.symbol != symbol {
            return Err(Error::UnknownSymbol(snapshot.symbol.clone()));
        }

        let mut book = OrderBook::from_snapshot(snapshot)?;
        let mut ordered: Vec<&Diff> = self.pending.iter().collect();
        ordered.sort_by_key(|d| d.sequence);

        let mut replayed = 0;
        let mut skipped = 0;
        for diff in ordered {
            if diff.sequence <= snapshot.sequence {
                skipped += 1;
                continue;
            }
            match book.apply_diff(diff)? {
                DiffOutcome::Applied(_) => replayed += 1,
                DiffOutcome::Stale => skipped += 1,
            }
        }

        self.pending.clear();
        self.latest_view = Some(book.view(symbol, view_depth));
        self.book = book;
        self.phase = Phase::Running;
        self.calibrated = true;
        self.failure = false;
        self.reset_count += 1;

        Ok(Calibration {
            snapshot_sequence: snapshot.sequence,
            sequence: self.book.sequence(),
            replayed,
            skipped,
            levels: self.book.level_count(),
        })
    }

    /// Record exhausted retries; returns false if the epoch is no longer current
    pub(super) fn fail(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.phase = Phase::Buffering;
        self.failure = true;
        true
    }

    /// Abort a calibration without marking failure
    pub(super) fn abandon(&mut self, epoch: u64) {
        if self.is_current(epoch) && self.phase == Phase::Calibrating {
            self.phase = Phase::Buffering;
        }
    }
}
