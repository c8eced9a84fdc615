//! Calibration and reset notifications.
//!
//! Observations publish [`BookEvent`]s on a shared broadcast channel. Slow
//! consumers lag rather than block publishers; a publisher with no receivers
//! simply drops the event.

use tokio::sync::broadcast;

use crate::types::Sequence;

/// Why an observation went back to buffering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetReason {
    /// Caller asked for it
    Requested,
    /// Feed connection was re-established
    Reconnect,
    /// Live sequence jumped past the tolerance
    SequenceGap {
        /// Highest sequence that would have been accepted
        expected: Sequence,
        /// Sequence received
        got: Sequence,
    },
    /// Level collection reported a duplicate or missing key
    Corruption,
    /// Pending buffer exceeded its bound before calibration
    BufferOverflow,
}

/// Notification about one symbol's book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookEvent {
    /// A snapshot was reconciled and live diffs now apply directly
    Calibrated {
        /// Symbol
        symbol: String,
        /// Book sequence after replay
        sequence: Sequence,
        /// Levels on both sides after replay
        levels: usize,
        /// Buffered diffs applied on top of the snapshot
        replayed: usize,
    },
    /// Book discarded; buffering again
    Reset {
        /// Symbol
        symbol: String,
        /// Trigger
        reason: ResetReason,
    },
    /// Snapshot retries exhausted; automatic calibration stopped
    Failed {
        /// Symbol
        symbol: String,
        /// Fetch attempts made
        attempts: u32,
    },
}

impl BookEvent {
    /// Symbol the event is about
    pub fn symbol(&self) -> &str {
        match self {
            BookEvent::Calibrated { symbol, .. }
            | BookEvent::Reset { symbol, .. }
            | BookEvent::Failed { symbol, .. } => symbol,
        }
    }
}

/// Cloneable publisher side of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<BookEvent>,
}

impl EventSender {
    /// Create a channel holding up to `capacity` undelivered events per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event
    pub fn emit(&self, event: BookEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// New receiver that sees events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BookEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new(1024)
    }
}
