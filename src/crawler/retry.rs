//! Retry policy and circuit breaker
//!
//! Both share one exponential backoff with jitter. The retry policy decides
//! whether a single failed scrape is attempted again inline; the circuit
//! breaker watches consecutive failures across the whole retailer.

use crate::config::{CircuitBreakerConfig, RetryConfig};
use crate::extractor::FailureKind;
use std::time::Duration;

/// Exponential backoff capped at `max`, plus up to 10% jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay before the retry following `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped = exponential.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            fastrand::u64(0..=capped * self.jitter_percent / 100)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Decides which failures are retried inline, and how often
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    pub retryable: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Retries transient errors and timeouts; never blocks, parse or proxy failures
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: ExponentialBackoff::new(config.base_delay_ms, config.max_delay_ms),
            retryable: vec![FailureKind::Transient, FailureKind::Timeout],
        }
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Whether a failure on 1-based `attempt` should be tried again
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        attempt < self.max_attempts && self.is_retryable(kind)
    }

    /// Delay after the failed 1-based `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt.saturating_sub(1))
    }
}

/// What the circuit breaker allows before the next item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Proceed,

    /// Sleep this long first
    Backoff(Duration),

    /// Abort the run
    Trip,
}

/// Consecutive-failure circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub soft_threshold: u32,
    pub hard_threshold: u32,
    backoff: ExponentialBackoff,
}

impl CircuitBreaker {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            soft_threshold: config.soft_threshold,
            hard_threshold: config.hard_threshold,
            backoff: ExponentialBackoff::new(config.backoff_base_ms, config.backoff_max_ms),
        }
    }

    /// Decides what to do given the current consecutive failure count
    ///
    /// Between the soft and hard thresholds the backoff doubles with every
    /// additional failure.
    pub fn check(&self, consecutive_failures: u32) -> BreakerDecision {
        if consecutive_failures >= self.hard_threshold {
            BreakerDecision::Trip
        } else if consecutive_failures >= self.soft_threshold {
            BreakerDecision::Backoff(
                self.backoff
                    .delay(consecutive_failures - self.soft_threshold),
            )
        } else {
            BreakerDecision::Proceed
        }
    }
}
