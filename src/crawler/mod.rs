//! Crawler module for catalog enumeration and scraping
//!
//! This module contains the core harvesting logic, including:
//! - Enumerating catalogs into manifests
//! - Batched, resumable scraping with bounded concurrency
//! - Per-domain rate limiting and proxy escalation
//! - Retry policy, circuit breaker and graceful interruption

mod coordinator;
mod enumerator;
mod escalation;
mod rate_limiter;
mod retry;
mod shutdown;

pub use coordinator::{RunOptions, RunReport, ScrapeCoordinator};
pub use enumerator::{EnumerationSummary, Enumerator};
pub use escalation::{BlockProxyManager, BlockStats, MIN_SAMPLES};
pub use rate_limiter::{domain_of, RateLimiter};
pub use retry::{BreakerDecision, CircuitBreaker, ExponentialBackoff, RetryPolicy};
pub use shutdown::{poll_notice_once, InterruptReason, InterruptionMonitor};
