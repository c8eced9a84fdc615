//! Core order book data structure.
//!
//! Two [`LevelCollection`]s (asks ascending, bids descending) plus the last
//! applied sequence number and timestamp. Diff application is the single
//! mutation path used both by snapshot replay and by live updates.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::Error;
use crate::types::{Diff, Price, Sequence, Side, Size, Snapshot, TimestampMs};

use super::level::{Ascending, Descending, LevelChange, LevelCollection, PriceLevel};

/// Ask side, lowest price first
pub type Asks = LevelCollection<PriceLevel, Ascending>;
/// Bid side, highest price first
pub type Bids = LevelCollection<PriceLevel, Descending>;

/// Result of applying one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Diff sequence was not newer than the book; nothing changed
    Stale,
    /// Diff was applied
    Applied(LevelChange),
}

/// Limit order book for a single symbol.
///
/// # Thread Safety
///
/// Not internally synchronized. An [`Observation`](crate::observation::Observation)
/// owns each book and guards it with its own lock.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    asks: Asks,
    bids: Bids,
    /// Last applied sequence; only ever increases
    sequence: Sequence,
    timestamp: TimestampMs,
}

/// Read-only top-of-book copy handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookView {
    /// Symbol of the book
    pub symbol: String,
    /// Book sequence at the time of the copy
    pub sequence: Sequence,
    /// Book timestamp at the time of the copy
    pub timestamp: TimestampMs,
    /// Best asks, lowest first
    pub asks: Vec<PriceLevel>,
    /// Best bids, highest first
    pub bids: Vec<PriceLevel>,
}

impl BookView {
    /// Best ask of the view
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Best bid of the view
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }
}

impl OrderBook {
    /// Create an empty book at sequence 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a book from an authoritative snapshot.
    ///
    /// Zero-size levels in the snapshot are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSnapshot`] for a non-positive price or a
    /// negative size, and [`Error::DuplicateKey`] if a side lists the same
    /// price twice.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, Error> {
        let mut book = Self {
            sequence: snapshot.sequence,
            timestamp: snapshot.timestamp,
            ..Self::default()
        };
        for &(price, size) in &snapshot.asks {
            if let Some(level) = snapshot_level(price, size, snapshot.sequence)? {
                book.asks.insert(level)?;
            }
        }
        for &(price, size) in &snapshot.bids {
            if let Some(level) = snapshot_level(price, size, snapshot.sequence)? {
                book.bids.insert(level)?;
            }
        }
        Ok(book)
    }

    /// Get the last applied sequence number
    #[must_use]
    pub const fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Get the book timestamp
    #[must_use]
    pub const fn timestamp(&self) -> TimestampMs {
        self.timestamp
    }

    /// Apply one diff.
    ///
    /// A diff whose sequence is not above the book's is stale and ignored, so
    /// replaying the same diff twice is harmless. A zero size removes the level
    /// (absent levels are a no-op); otherwise an existing level is updated in
    /// place and a missing one inserted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`] or [`Error::MissingKey`] only if the
    /// collection disagrees with its own lookup, which means it is corrupted.
    pub fn apply_diff(&mut self, diff: &Diff) -> Result<DiffOutcome, Error> {
        if diff.sequence <= self.sequence {
            return Ok(DiffOutcome::Stale);
        }

        let change = match diff.side {
            Side::Ask => Self::write_level(&mut self.asks, diff)?,
            Side::Bid => Self::write_level(&mut self.bids, diff)?,
        };

        self.sequence = self.sequence.max(diff.sequence);
        if let Some(ts) = diff.timestamp {
            self.timestamp = self.timestamp.max(ts);
        }
        Ok(DiffOutcome::Applied(change))
    }

    fn write_level<O: super::level::Orderable>(
        side: &mut LevelCollection<PriceLevel, O>,
        diff: &Diff,
    ) -> Result<LevelChange, Error> {
        if diff.is_removal() {
            return Ok(match side.remove(diff.price) {
                Some(_) => LevelChange::Removed,
                None => LevelChange::Unchanged,
            });
        }

        if side.contains(diff.price) {
            side.update(diff.price, diff.size, Some(diff.sequence))?;
            Ok(LevelChange::Updated)
        } else {
            side.insert(PriceLevel::new(diff.price, diff.size).with_sequence(diff.sequence))?;
            Ok(LevelChange::Inserted)
        }
    }

    /// Ask side
    pub fn asks(&self) -> &Asks {
        &self.asks
    }

    /// Bid side
    pub fn bids(&self) -> &Bids {
        &self.bids
    }

    /// Get the best bid (highest bid)
    ///
    /// Returns `(price, size)` or `None` if no bids.
    #[must_use]
    pub fn best_bid(&self) -> Option<(Price, Size)> {
        self.bids.best().map(|l| (l.price, l.size))
    }

    /// Get the best ask (lowest ask)
    ///
    /// Returns `(price, size)` or `None` if no asks.
    #[must_use]
    pub fn best_ask(&self) -> Option<(Price, Size)> {
        self.asks.best().map(|l| (l.price, l.size))
    }

    /// Average of best bid and best ask, or `None` if either is missing
    #[must_use]
    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Best ask minus best bid
    #[must_use]
    pub fn spread(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask - bid),
            _ => None,
        }
    }

    /// Check if the book is crossed (best bid >= best ask)
    ///
    /// Not enforced; a crossed book usually means the feed is lagging.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Get the top N bid levels
    #[must_use]
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids.top(n).cloned().collect()
    }

    /// Get the top N ask levels
    #[must_use]
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks.top(n).cloned().collect()
    }

    /// Copy the top `depth` levels of each side
    #[must_use]
    pub fn view(&self, symbol: &str, depth: usize) -> BookView {
        BookView {
            symbol: symbol.to_string(),
            sequence: self.sequence,
            timestamp: self.timestamp,
            asks: self.top_asks(depth),
            bids: self.top_bids(depth),
        }
    }

    /// Check if the book is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Get the number of price levels as `(bids, asks)`
    #[must_use]
    pub fn num_levels(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    /// Total number of levels on both sides
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

fn snapshot_level(price: Price, size: Size, sequence: Sequence) -> Result<Option<PriceLevel>, Error> {
    if price <= Decimal::ZERO {
        return Err(Error::InvalidSnapshot(format!("non-positive price {price}")));
    }
    if size < Decimal::ZERO {
        return Err(Error::InvalidSnapshot(format!("negative size {size} at {price}")));
    }
    if size.is_zero() {
        return Ok(None);
    }
    Ok(Some(PriceLevel::new(price, size).with_sequence(sequence)))
}
