//! # book-sync
//!
//! Client-side order book synchronizer: rebuilds consistent limit order books
//! from a diff-based feed and an on-demand snapshot, for many symbols at once.
//!
//! ## Features
//!
//! - **Calibration protocol** - buffer diffs, reconcile with a snapshot,
//!   replay in sequence order, reset on gaps, reconnects and corruption
//! - **Bounded worker pool** - per-symbol maintenance packed onto a few
//!   threads with runtime rebalancing
//! - **Exact prices** - `rust_decimal` everywhere, never floating point
//! - **Async snapshot fetches** - on Tokio, never on the worker threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use book_sync::client::{ReconnectConfig, ReconnectingFeed, RestSnapshotProvider};
//! use book_sync::config::{CalibrationConfig, DistributorConfig, FeedConfig};
//! use book_sync::{BookManager, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), book_sync::Error> {
//!     let feed = FeedConfig::new("https://api.example.com/v1/", "wss://stream.example.com/ws");
//!
//!     let provider = Arc::new(RestSnapshotProvider::new(&feed)?);
//!     let pool = Arc::new(WorkerPool::new(DistributorConfig::default().with_max_tenants(16))?);
//!     let manager = BookManager::new(provider, pool, CalibrationConfig::default())?;
//!
//!     let mut stream = ReconnectingFeed::connect(&feed, ReconnectConfig::default()).await?;
//!     for symbol in ["BTC-USD", "ETH-USD"] {
//!         manager.subscribe(symbol)?;
//!     }
//!     stream.subscribe(&["BTC-USD", "ETH-USD"]).await?;
//!
//!     stream.drive(&manager).await
//! }
//! ```
//!
//! ## Architecture
//!
//! This crate is organized into several modules:
//!
//! - [`orderbook`] - price-level collections, the two-sided book, and [`BookManager`]
//! - [`observation`] - the per-symbol calibration state machine
//! - [`distributor`] - the bounded [`WorkerPool`]
//! - [`provider`] - the snapshot source contract
//! - [`events`] - calibration, reset and failure notifications
//! - [`client`] - REST snapshot and WebSocket feed adapters
//! - [`types`] - diffs, snapshots and feed frames
//! - [`config`] - configuration
//! - [`error`] - error types for the crate
//!
//! ## Logging
//!
//! Everything logs through `tracing`. The crate installs no subscriber.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod observation;
pub mod orderbook;
pub mod provider;
pub mod types;

// Re-export main types at crate root for convenience
pub use config::{CalibrationConfig, DistributorConfig, FeedConfig};
pub use distributor::{Tenant, WorkerPool};
pub use error::Error;
pub use events::{BookEvent, ResetReason};
pub use observation::Observation;
pub use orderbook::{BookManager, BookView, OrderBook};
pub use provider::SnapshotProvider;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;
