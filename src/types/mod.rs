//! Core value types shared by the book, the calibration protocol and the
//! feed adapters.
//!
//! - [`Diff`] - an incremental price-level update
//! - [`Snapshot`] - an authoritative full book at a sequence number
//! - [`messages`] - stream frames exchanged with a diff feed

pub mod messages;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use messages::{FeedCommand, FeedMessage};

/// Price of a level.
///
/// Exact decimal so that keys compare exactly; never floating point.
pub type Price = Decimal;

/// Aggregate size resting at a price
pub type Size = Decimal;

/// Feed sequence number
pub type Sequence = u64;

/// Timestamp in milliseconds since Unix epoch
pub type TimestampMs = u64;

/// Book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Sell interest, best = lowest price
    Ask,
    /// Buy interest, best = highest price
    Bid,
}

/// Incremental update of one price level.
///
/// `size` is the new absolute size at `price`; zero removes the level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Symbol this update belongs to
    pub symbol: String,
    /// Side of the book
    pub side: Side,
    /// Price level being updated
    pub price: Price,
    /// New aggregate size (0 = remove)
    pub size: Size,
    /// Feed sequence number
    pub sequence: Sequence,
    /// Venue timestamp, if the feed stamps diffs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampMs>,
}

impl Diff {
    /// Create a diff without a venue timestamp
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        price: Price,
        size: Size,
        sequence: Sequence,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price,
            size,
            sequence,
            timestamp: None,
        }
    }

    /// Attach a venue timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: TimestampMs) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether this diff removes its level
    pub fn is_removal(&self) -> bool {
        self.size.is_zero()
    }
}

/// Authoritative book state at `sequence`.
///
/// Levels are `[price, size]` pairs; order within each side is not assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Symbol of the book
    pub symbol: String,
    /// Last sequence reflected in the snapshot
    pub sequence: Sequence,
    /// Venue timestamp of the snapshot
    #[serde(default)]
    pub timestamp: TimestampMs,
    /// Ask levels: [[price, size], ...]
    #[serde(default)]
    pub asks: Vec<(Price, Size)>,
    /// Bid levels: [[price, size], ...]
    #[serde(default)]
    pub bids: Vec<(Price, Size)>,
}

impl Snapshot {
    /// Create an empty snapshot at `sequence`
    pub fn new(symbol: impl Into<String>, sequence: Sequence) -> Self {
        Self {
            symbol: symbol.into(),
            sequence,
            timestamp: 0,
            asks: Vec::new(),
            bids: Vec::new(),
        }
    }

    /// Add an ask level
    #[must_use]
    pub fn with_ask(mut self, price: Price, size: Size) -> Self {
        self.asks.push((price, size));
        self
    }

    /// Add a bid level
    #[must_use]
    pub fn with_bid(mut self, price: Price, size: Size) -> Self {
        self.bids.push((price, size));
        self
    }

    /// Set the venue timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: TimestampMs) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_diff_decodes_string_decimals() {
        let json = r#"{"symbol":"ETH-USD","side":"bid","price":"10.00","size":"3","sequence":101}"#;
        let diff: Diff = serde_json::from_str(json).unwrap();
        assert_eq!(diff.side, Side::Bid);
        assert_eq!(diff.price, dec!(10.00));
        assert_eq!(diff.size, dec!(3));
        assert_eq!(diff.timestamp, None);
        assert!(!diff.is_removal());
    }

    #[test]
    fn test_diff_rejects_non_numeric_price() {
        let json = r#"{"symbol":"ETH-USD","side":"ask","price":"ten","size":"1","sequence":1}"#;
        assert!(serde_json::from_str::<Diff>(json).is_err());
    }

    #[test]
    fn test_snapshot_levels() {
        let json = r#"{"symbol":"ETH-USD","sequence":100,"timestamp":5,"asks":[["10.01","3"]],"bids":[["10.00","5"]]}"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.sequence, 100);
        assert_eq!(snapshot.asks, vec![(dec!(10.01), dec!(3))]);
        assert_eq!(snapshot.bids, vec![(dec!(10.00), dec!(5))]);
    }
}
