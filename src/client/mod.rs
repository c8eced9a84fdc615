//! Network adapters for a venue speaking the bundled JSON shapes.
//!
//! This module contains:
//!
//! - [`rest`] - HTTP [`SnapshotProvider`](crate::provider::SnapshotProvider)
//! - [`websocket`] - WebSocket diff feed with reconnection

pub mod rest;
pub mod websocket;

pub use rest::RestSnapshotProvider;
pub use websocket::{FeedClient, FeedEvent, ReconnectConfig, ReconnectingFeed};
