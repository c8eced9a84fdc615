//! Order book data structures and the multi-symbol manager.
//!
//! This module provides:
//!
//! - [`level`] - price levels and the ordered, price-keyed side collection
//! - [`book`] - the two-sided [`OrderBook`] with sequence tracking
//! - [`manager`] - [`BookManager`], the consumer-facing subscribe/route/view surface
//!
//! # Example
//!
//! ```rust
//! use book_sync::orderbook::OrderBook;
//! use book_sync::types::{Diff, Side};
//! use rust_decimal::Decimal;
//!
//! let mut book = OrderBook::new();
//!
//! // Apply diffs: absolute size per price, zero removes the level
//! book.apply_diff(&Diff::new("BTC-USD", Side::Bid, Decimal::new(1000, 2), Decimal::new(5, 0), 1)).unwrap();
//! book.apply_diff(&Diff::new("BTC-USD", Side::Ask, Decimal::new(1001, 2), Decimal::new(3, 0), 2)).unwrap();
//!
//! if let Some((price, size)) = book.best_bid() {
//!     println!("Best bid: {} @ {}", size, price);
//! }
//! ```

pub mod book;
pub mod level;
pub mod manager;

pub use book::{BookView, DiffOutcome, OrderBook};
pub use level::{Ascending, Descending, LevelChange, LevelCollection, Orderable, PriceKeyed, PriceLevel};
pub use manager::BookManager;
