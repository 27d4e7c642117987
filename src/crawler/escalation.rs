//! Block / proxy escalation
//!
//! Tracks block statistics for one retailer and decides when to move from
//! direct fetching to the proxy pool. The transition is one-way for the life
//! of the process; going back to direct fetching takes an operator restart.

use crate::config::ProxyConfig;
use crate::state::{BlockState, FetchMode};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Requests the window must hold before its block rate is trusted
pub const MIN_SAMPLES: u32 = 50;

/// Point-in-time copy of the block statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStats {
    pub mode: FetchMode,
    pub request_count: u32,
    pub block_count: u32,
    pub block_rate_percent: f64,
    pub consecutive_failures: u32,
}

/// Shared block/proxy state machine for one retailer
pub struct BlockProxyManager {
    retailer: String,
    proxy_available: bool,
    auto_escalate: bool,
    threshold_percent: f64,
    threshold_count: u32,
    window: Duration,
    state: Mutex<BlockState>,
}

impl BlockProxyManager {
    /// Creates the manager for a retailer
    ///
    /// Runs start proxied when the proxy is enabled and configured.
    pub fn new(retailer: &str, proxy: &ProxyConfig) -> Self {
        let proxy_available = proxy.is_configured();
        let mode = if proxy.enabled && proxy_available {
            FetchMode::Proxied
        } else {
            FetchMode::Direct
        };

        Self {
            retailer: retailer.to_string(),
            proxy_available,
            auto_escalate: proxy.auto_escalate,
            threshold_percent: proxy.threshold_percent,
            threshold_count: proxy.threshold_count,
            window: proxy.window(),
            state: Mutex::new(BlockState::new(mode)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BlockState> {
        // Every update leaves the counters consistent, so a poisoned state is usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the outcome of one request
    ///
    /// A not-found product is a successful request and should be recorded as
    /// `success = true`.
    pub fn record(&self, success: bool, is_block: bool) {
        self.lock()
            .record_at(success, is_block, Instant::now(), self.window);
    }

    fn escalation_reason(&self, state: &BlockState) -> Option<String> {
        if state.mode.is_proxied() || !self.proxy_available || !self.auto_escalate {
            return None;
        }

        if state.request_count >= MIN_SAMPLES && state.block_rate_at_least(self.threshold_percent)
        {
            return Some(format!(
                "block rate {:.1}% over {} requests (threshold {:.1}%)",
                state.block_rate_percent(),
                state.request_count,
                self.threshold_percent
            ));
        }

        if state.consecutive_failures >= self.threshold_count {
            return Some(format!(
                "{} consecutive failures (threshold {})",
                state.consecutive_failures, self.threshold_count
            ));
        }

        None
    }

    /// Whether the thresholds call for switching to the proxy pool
    pub fn should_escalate(&self) -> bool {
        let state = self.lock();
        self.escalation_reason(&state).is_some()
    }

    /// Switches to proxied mode
    ///
    /// # Returns
    ///
    /// `true` only for the call that performed the transition
    pub fn escalate(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if state.mode.is_proxied() || !self.proxy_available {
            return false;
        }

        state.mode = FetchMode::Proxied;
        tracing::warn!(
            "ESCALATING {} TO PROXY: {} (window: {} requests, {} blocked)",
            self.retailer,
            reason,
            state.request_count,
            state.block_count
        );
        true
    }

    /// Checks the thresholds and escalates in one step
    ///
    /// # Returns
    ///
    /// `true` if this call switched the retailer to the proxy pool
    pub fn escalate_if_needed(&self) -> bool {
        let reason = {
            let state = self.lock();
            self.escalation_reason(&state)
        };
        match reason {
            Some(reason) => self.escalate(&reason),
            None => false,
        }
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.lock().mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn stats(&self) -> BlockStats {
        let state = self.lock();
        BlockStats {
            mode: state.mode,
            request_count: state.request_count,
            block_count: state.block_count,
            block_rate_percent: state.block_rate_percent(),
            consecutive_failures: state.consecutive_failures,
        }
    }
}
