//! Error types for the book-sync crate.
//!
//! Errors fall into four groups:
//!
//! - **Transient** transport failures (network, timeout, rate limiting) that
//!   the calibration protocol retries.
//! - **Protocol** anomalies (sequence gaps, malformed diffs) that are recovered
//!   locally by resetting the affected observation.
//! - **Corruption** of a price-level collection (duplicate or missing key),
//!   also recovered by reset and never surfaced from diff ingestion.
//! - **Terminal** conditions such as using an observation after disposal.

use std::fmt;

use thiserror::Error;

use crate::types::Price;

/// The main error type for this crate
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot endpoint returned an error response
    #[error("API error {0}")]
    Api(ApiError),

    /// Rate limit exceeded
    #[error("rate limited{}", retry_suffix(.retry_after_ms))]
    RateLimited {
        /// Retry after this many milliseconds
        retry_after_ms: Option<u64>,
    },

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Feed connection closed unexpectedly
    #[error("feed connection closed")]
    ConnectionClosed,

    /// Diff sequence jumped further than the configured tolerance
    #[error("sequence gap: expected at most {expected}, got {got}")]
    SequenceGap {
        /// Highest sequence that would have been accepted
        expected: u64,
        /// Actual sequence number received
        got: u64,
    },

    /// Insert into a price-level collection that already holds the price
    #[error("duplicate price level {price}")]
    DuplicateKey {
        /// Offending price
        price: Price,
    },

    /// Update of a price level that is not in the collection
    #[error("missing price level {price}")]
    MissingKey {
        /// Offending price
        price: Price,
    },

    /// Diff rejected before it reached the book
    #[error("invalid diff: {0}")]
    InvalidDiff(String),

    /// Snapshot carries a level no book may hold
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Diff or request for a symbol that is not subscribed here
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Snapshot retries exhausted; the observation is marked as failed
    #[error("calibration of {symbol} failed after {attempts} attempts")]
    CalibrationFailed {
        /// Symbol whose calibration failed
        symbol: String,
        /// Number of fetch attempts made
        attempts: u32,
    },

    /// Another calibration of the same observation is still in flight
    #[error("calibration of {0} already in progress")]
    CalibrationInProgress(String),

    /// A reset happened while the snapshot was being fetched
    #[error("calibration of {0} superseded by a reset")]
    Superseded(String),

    /// Operation on an observation or pool that has been torn down
    #[error("{0} has been disposed")]
    Disposed(String),

    /// Worker thread could not be started
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration (out-of-range value, bad URL)
    #[error("configuration error: {0}")]
    Config(String),
}

/// Error returned by a snapshot endpoint
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status code
    pub status: u16,
    /// Error code from API (if provided)
    pub code: Option<String>,
    /// Error message
    pub message: String,
}

impl Error {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout | Error::ConnectionClosed => true,
            Error::RateLimited { .. } => true,
            Error::Api(e) => e.is_server_error(),
            _ => false,
        }
    }

    /// Whether this error indicates a structurally corrupted book.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::DuplicateKey { .. } | Error::MissingKey { .. })
    }
}

fn retry_suffix(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(", retry after {ms}ms"),
        None => String::new(),
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}): {}", self.status, self.message)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {err}"))
    }
}

impl ApiError {
    /// Create a new API error
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}
