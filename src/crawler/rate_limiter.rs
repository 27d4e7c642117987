//! Per-domain jittered rate limiting
//!
//! Every request to a domain waits for a delay drawn uniformly from
//! `[min_delay, max_delay]`, measured from the previous request to that
//! domain. Callers for one domain are serialized; distinct domains proceed
//! concurrently.

use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time of the last granted slot for one domain
type DomainSlot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Domain-scoped rate limiter shared by all scrape tasks
pub struct RateLimiter {
    min_delay: Duration,
    max_delay: Duration,
    domains: Mutex<HashMap<String, DomainSlot>>,
}

impl RateLimiter {
    /// Creates a limiter with the given delay range
    ///
    /// A reversed range is treated as `[max, min]`.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };

        Self {
            min_delay,
            max_delay,
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// The configured delay range
    pub fn delay_range(&self) -> (Duration, Duration) {
        (self.min_delay, self.max_delay)
    }

    /// Draws one delay uniformly from the configured range
    pub fn jittered_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(fastrand::u64(min..=max))
    }

    fn slot(&self, domain: &str) -> DomainSlot {
        // A poisoned map is still a valid map of slots
        let mut domains = self.domains.lock().unwrap_or_else(|e| e.into_inner());
        domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Waits until a request to `domain` may be sent
    ///
    /// The first request to a domain waits one full delay; later requests
    /// wait until a freshly drawn delay has elapsed since the previous
    /// grant.
    ///
    /// # Returns
    ///
    /// The instant the request slot was granted
    pub async fn wait(&self, domain: &str) -> Instant {
        let slot = self.slot(domain);
        let mut last = slot.lock().await;

        let delay = self.jittered_delay();
        let ready_at = match *last {
            Some(previous) => previous + delay,
            None => Instant::now() + delay,
        };
        if ready_at > Instant::now() {
            tokio::time::sleep_until(tokio::time::Instant::from_std(ready_at)).await;
        }

        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}

/// Host of a URL, used as the rate-limiting domain
///
/// Unparseable URLs share the `"default"` domain.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_else(|| "default".to_string())
}
