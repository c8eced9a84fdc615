//! Configuration for calibration, the worker pool and the feed adapters.
//!
//! - [`CalibrationConfig`] - per-observation snapshot/replay tuning
//! - [`DistributorConfig`] - worker pool capacity and cadence
//! - [`FeedConfig`] - endpoints of the bundled REST and stream adapters

use std::time::Duration;

use crate::error::Error;

/// Largest accepted `max_tenants`
pub const MAX_TENANTS_LIMIT: usize = 255;
/// Largest accepted `idle_sleep_time`, in milliseconds
pub const IDLE_SLEEP_LIMIT_MS: u64 = 100;
/// Largest accepted `sleep_divisor`
pub const SLEEP_DIVISOR_LIMIT: u32 = 10_000;

/// Tuning of the snapshot calibration protocol.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use book_sync::config::CalibrationConfig;
///
/// let config = CalibrationConfig::default()
///     .with_max_timeout_retries(5)
///     .with_reset_timeout(Duration::from_millis(250))
///     .with_max_sequence_gap(Some(1));
/// assert_eq!(config.max_timeout_retries(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Retries after the first failed snapshot fetch
    max_timeout_retries: u32,
    /// Pause between snapshot fetch attempts
    reset_timeout: Duration,
    /// Upper bound on a single snapshot fetch
    request_timeout: Duration,
    /// How long diffs are buffered after a reset before the snapshot is requested
    buffering_window: Duration,
    /// Pending diffs kept before the observation gives up and resets
    max_buffered_diffs: usize,
    /// Largest accepted jump between consecutive live sequences
    max_sequence_gap: Option<u64>,
    /// Depth of the view cached on every maintenance cycle
    view_depth: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            max_timeout_retries: 3,
            reset_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            buffering_window: Duration::from_millis(50),
            max_buffered_diffs: 10_000,
            max_sequence_gap: None,
            view_depth: 10,
        }
    }
}

impl CalibrationConfig {
    /// Set how many times a failed snapshot fetch is retried
    #[must_use]
    pub fn with_max_timeout_retries(mut self, retries: u32) -> Self {
        self.max_timeout_retries = retries;
        self
    }

    /// Set the pause between fetch attempts
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the timeout of a single fetch
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the buffering window that precedes a snapshot request
    #[must_use]
    pub fn with_buffering_window(mut self, window: Duration) -> Self {
        self.buffering_window = window;
        self
    }

    /// Set the pending buffer bound
    #[must_use]
    pub fn with_max_buffered_diffs(mut self, max: usize) -> Self {
        self.max_buffered_diffs = max;
        self
    }

    /// Set the live sequence gap tolerance (`None` disables gap detection)
    #[must_use]
    pub fn with_max_sequence_gap(mut self, gap: Option<u64>) -> Self {
        self.max_sequence_gap = gap;
        self
    }

    /// Set the depth of the cached view
    #[must_use]
    pub fn with_view_depth(mut self, depth: usize) -> Self {
        self.view_depth = depth;
        self
    }

    /// Get the retry count
    pub fn max_timeout_retries(&self) -> u32 {
        self.max_timeout_retries
    }

    /// Get the pause between attempts
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Get the single-fetch timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Get the buffering window
    pub fn buffering_window(&self) -> Duration {
        self.buffering_window
    }

    /// Get the pending buffer bound
    pub fn max_buffered_diffs(&self) -> usize {
        self.max_buffered_diffs
    }

    /// Get the gap tolerance
    pub fn max_sequence_gap(&self) -> Option<u64> {
        self.max_sequence_gap
    }

    /// Get the cached view depth
    pub fn view_depth(&self) -> usize {
        self.view_depth
    }
}

/// Scheduling priority of worker threads.
///
/// On Linux each worker sets its own nice value when it starts: `Low` is
/// nice 10, `High` is nice -10 (needs `CAP_SYS_NICE`), `Normal` leaves the
/// inherited value. Elsewhere only `Normal` can be applied. The priority is
/// also tagged in the thread name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerPriority {
    /// Background work
    Low,
    /// Default scheduling
    #[default]
    Normal,
    /// Latency-sensitive work
    High,
}

impl WorkerPriority {
    /// Nice value to apply, `None` to keep the inherited one
    pub fn nice(self) -> Option<i32> {
        match self {
            WorkerPriority::Low => Some(10),
            WorkerPriority::Normal => None,
            WorkerPriority::High => Some(-10),
        }
    }

    /// Short tag used in thread names
    pub fn tag(self) -> &'static str {
        match self {
            WorkerPriority::Low => "lo",
            WorkerPriority::Normal => "nr",
            WorkerPriority::High => "hi",
        }
    }
}

/// Worker pool capacity and cadence.
///
/// # Example
///
/// ```rust
/// use book_sync::config::DistributorConfig;
///
/// let config = DistributorConfig::default()
///     .with_max_tenants(4)
///     .with_idle_sleep_time(2)
///     .with_sleep_divisor(10);
/// assert!(config.validate().is_ok());
/// assert!(config.with_max_tenants(0).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorConfig {
    /// Observations served by one worker
    max_tenants: usize,
    /// Idle sleep, in milliseconds
    idle_sleep_time: u64,
    /// Cycles between idle sleeps
    sleep_divisor: u32,
    /// Worker scheduling hint
    priority: WorkerPriority,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            max_tenants: 8,
            idle_sleep_time: 1,
            sleep_divisor: 1,
            priority: WorkerPriority::Normal,
        }
    }
}

impl DistributorConfig {
    /// Set the per-worker capacity (1-255)
    #[must_use]
    pub fn with_max_tenants(mut self, max_tenants: usize) -> Self {
        self.max_tenants = max_tenants;
        self
    }

    /// Set the idle sleep in milliseconds (0-100)
    #[must_use]
    pub fn with_idle_sleep_time(mut self, ms: u64) -> Self {
        self.idle_sleep_time = ms;
        self
    }

    /// Set the number of cycles between idle sleeps (0-10000, 0 sleeps every cycle)
    #[must_use]
    pub fn with_sleep_divisor(mut self, divisor: u32) -> Self {
        self.sleep_divisor = divisor;
        self
    }

    /// Set the worker priority hint
    #[must_use]
    pub fn with_priority(mut self, priority: WorkerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Get the per-worker capacity
    pub fn max_tenants(&self) -> usize {
        self.max_tenants
    }

    /// Get the idle sleep duration
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_time)
    }

    /// Get the idle sleep in milliseconds
    pub fn idle_sleep_time(&self) -> u64 {
        self.idle_sleep_time
    }

    /// Get the cycles between idle sleeps
    pub fn sleep_divisor(&self) -> u32 {
        self.sleep_divisor
    }

    /// Get the priority hint
    pub fn priority(&self) -> WorkerPriority {
        self.priority
    }

    /// Whether the worker sleeps after completing `cycle` (1-based)
    pub fn sleeps_after(&self, cycle: u64) -> bool {
        let divisor = u64::from(self.sleep_divisor.max(1));
        cycle % divisor == 0
    }

    /// Check every field against its accepted range
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=MAX_TENANTS_LIMIT).contains(&self.max_tenants) {
            return Err(Error::Config(format!(
                "max_tenants must be in 1..={MAX_TENANTS_LIMIT}, got {}",
                self.max_tenants
            )));
        }
        if self.idle_sleep_time > IDLE_SLEEP_LIMIT_MS {
            return Err(Error::Config(format!(
                "idle_sleep_time must be in 0..={IDLE_SLEEP_LIMIT_MS}, got {}",
                self.idle_sleep_time
            )));
        }
        if self.sleep_divisor > SLEEP_DIVISOR_LIMIT {
            return Err(Error::Config(format!(
                "sleep_divisor must be in 0..={SLEEP_DIVISOR_LIMIT}, got {}",
                self.sleep_divisor
            )));
        }
        Ok(())
    }
}

/// Endpoints of the bundled feed adapters.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Base URL of the snapshot REST endpoint
    rest_base_url: String,

    /// URL of the diff stream
    websocket_url: String,

    /// HTTP request timeout
    timeout: Duration,
}

impl FeedConfig {
    /// Create a configuration for the given endpoints
    ///
    /// # Example
    ///
    /// ```rust
    /// use book_sync::config::FeedConfig;
    ///
    /// let config = FeedConfig::new("https://md.example.com/v1", "wss://md.example.com/stream");
    /// assert_eq!(config.rest_base_url(), "https://md.example.com/v1");
    /// ```
    pub fn new(rest_base_url: impl Into<String>, websocket_url: impl Into<String>) -> Self {
        Self {
            rest_base_url: rest_base_url.into(),
            websocket_url: websocket_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the HTTP request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get the REST base URL
    pub fn rest_base_url(&self) -> &str {
        &self.rest_base_url
    }

    /// Get the stream URL
    pub fn websocket_url(&self) -> &str {
        &self.websocket_url
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_calibration_config() {
        let config = CalibrationConfig::default();
        assert_eq!(config.max_timeout_retries(), 3);
        assert_eq!(config.reset_timeout(), Duration::from_millis(500));
        assert_eq!(config.buffering_window(), Duration::from_millis(50));
        assert_eq!(config.max_sequence_gap(), None);
    }

    #[test]
    fn test_distributor_ranges() {
        assert!(DistributorConfig::default().validate().is_ok());
        assert!(DistributorConfig::default()
            .with_max_tenants(255)
            .validate()
            .is_ok());
        assert!(DistributorConfig::default()
            .with_max_tenants(256)
            .validate()
            .is_err());
        assert!(DistributorConfig::default()
            .with_idle_sleep_time(101)
            .validate()
            .is_err());
        assert!(DistributorConfig::default()
            .with_sleep_divisor(10_001)
            .validate()
            .is_err());
    }

    #[test]
    fn test_sleep_cadence() {
        let every_third = DistributorConfig::default().with_sleep_divisor(3);
        assert!(!every_third.sleeps_after(1));
        assert!(!every_third.sleeps_after(2));
        assert!(every_third.sleeps_after(3));

        let every_cycle = DistributorConfig::default().with_sleep_divisor(0);
        assert!(every_cycle.sleeps_after(1));
        assert!(every_cycle.sleeps_after(2));
    }

    #[test]
    fn test_feed_config_builder() {
        let config = FeedConfig::new("http://localhost:8080", "ws://localhost:8081")
            .with_timeout(Duration::from_secs(30));
        assert_eq!(config.websocket_url(), "ws://localhost:8081");
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }
}
