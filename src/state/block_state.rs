use std::fmt;
use std::time::{Duration, Instant};

/// How outbound requests for a retailer are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Straight from this host's network
    Direct,

    /// Through the configured proxy pool
    Proxied,
}

impl FetchMode {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Self::Proxied)
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Proxied => write!(f, "proxied"),
        }
    }
}

/// Block statistics for one retailer
///
/// The request/block counters cover a sliding window that restarts once the
/// window duration has elapsed; `consecutive_failures` spans windows and is
/// only cleared by a non-blocked success.
#[derive(Debug, Clone)]
pub struct BlockState {
    /// Current routing mode
    pub mode: FetchMode,

    /// Requests recorded in the current window
    pub request_count: u32,

    /// Blocked requests recorded in the current window
    pub block_count: u32,

    /// Failures since the last non-blocked success
    pub consecutive_failures: u32,

    /// When the current window began
    pub window_started: Instant,
}

impl BlockState {
    pub fn new(mode: FetchMode) -> Self {
        Self {
            mode,
            request_count: 0,
            block_count: 0,
            consecutive_failures: 0,
            window_started: Instant::now(),
        }
    }

    /// Records one request outcome observed at `now`
    ///
    /// # Arguments
    ///
    /// * `success` - The request completed without error
    /// * `is_block` - The response was recognised as an anti-automation block
    /// * `now` - Observation time, used to roll the window
    /// * `window` - Sliding window length
    pub fn record_at(&mut self, success: bool, is_block: bool, now: Instant, window: Duration) {
        if now.saturating_duration_since(self.window_started) > window {
            self.request_count = 0;
            self.block_count = 0;
            self.window_started = now;
        }

        self.request_count += 1;
        if is_block {
            self.block_count += 1;
        }

        if success && !is_block {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }

    /// Block rate of the current window as a percentage
    pub fn block_rate_percent(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            f64::from(self.block_count) / f64::from(self.request_count) * 100.0
        }
    }

    /// Whether the window's block rate is at or above `threshold_percent`
    ///
    /// Compares `blocks * 100` with `threshold * requests` so that a window
    /// sitting exactly on the threshold counts.
    pub fn block_rate_at_least(&self, threshold_percent: f64) -> bool {
        f64::from(self.block_count) * 100.0 >= threshold_percent * f64::from(self.request_count)
    }
}
