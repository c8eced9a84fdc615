//! Feed stream frames.
//!
//! Commands sent to a diff feed and messages received from it. The shape is a
//! neutral JSON envelope tagged by `op` (commands) or `type` (messages); venue
//! specific encodings are expected to be translated into these before they
//! reach an observation.

use serde::{Deserialize, Serialize};

use super::{Diff, Snapshot};

/// Command sent to the feed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FeedCommand {
    /// Start streaming diffs for symbols
    Subscribe {
        /// Message ID
        id: u64,
        /// Symbols to stream
        symbols: Vec<String>,
    },
    /// Stop streaming diffs for symbols
    Unsubscribe {
        /// Message ID
        id: u64,
        /// Symbols to stop
        symbols: Vec<String>,
    },
}

/// Message received from the feed
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Subscription confirmed
    Subscribed(SubscribedMsg),
    /// Unsubscription confirmed
    Unsubscribed(SubscribedMsg),
    /// Incremental price-level update
    Diff(Diff),
    /// Full book pushed over the stream
    Snapshot(Snapshot),
    /// Keep-alive with no payload
    Heartbeat,
    /// Error response
    Error(ErrorMsg),
}

/// Subscription acknowledgement
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribedMsg {
    /// Message ID (matches the request)
    pub id: Option<u64>,
    /// Symbols covered by the acknowledgement
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Error message
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMsg {
    /// Message ID
    pub id: Option<u64>,
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl FeedMessage {
    /// Symbol the message is about, if it carries book data
    pub fn symbol(&self) -> Option<&str> {
        match self {
            FeedMessage::Diff(diff) => Some(&diff.symbol),
            FeedMessage::Snapshot(snapshot) => Some(&snapshot.symbol),
            _ => None,
        }
    }
}
