use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Main configuration structure for Catalog-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(rename = "circuit-breaker", default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub interruption: InterruptionConfig,
    pub output: OutputConfig,
    #[serde(rename = "retailer", default)]
    pub retailers: Vec<RetailerConfig>,
}

impl Config {
    /// Looks up a retailer profile by name
    pub fn retailer(&self, name: &str) -> Option<&RetailerConfig> {
        self.retailers.iter().find(|r| r.name == name)
    }
}

/// Batch and scheduling behaviour of the scrape coordinator
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HarvestConfig {
    /// Manifest rows read per batch; each batch is a synchronization barrier
    pub batch_size: usize,

    /// Number of successful persists between export snapshots
    pub export_every: u64,

    /// Number of settled items between progress log lines
    pub progress_interval: u64,

    /// Timeout applied to every outbound request (seconds)
    pub request_timeout_secs: u64,

    /// How long an interrupted batch may keep draining in-flight items (seconds)
    pub drain_timeout_secs: u64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            export_every: 1_000,
            progress_interval: 100,
            request_timeout_secs: 30,
            drain_timeout_secs: 30,
            user_agent: format!("catalog-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HarvestConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Jittered per-domain request spacing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    /// Lower bound of the randomized delay between requests to one domain (milliseconds)
    pub min_delay_ms: u64,

    /// Upper bound of the randomized delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 150,
            max_delay_ms: 500,
        }
    }
}

/// Inline retry policy for retryable failures
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    /// Total attempts per item, including the first one
    pub max_attempts: u32,

    /// Backoff before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
        }
    }
}

/// Consecutive-failure circuit breaker thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures after which items back off before dispatch
    pub soft_threshold: u32,

    /// Consecutive failures after which the whole run aborts
    pub hard_threshold: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 10,
            hard_threshold: 50,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

/// Proxy pool and escalation thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// Start every run already proxied
    pub enabled: bool,

    /// Escalate from direct to proxied fetching when block thresholds are hit
    pub auto_escalate: bool,

    /// Proxy pool endpoint, e.g. "http://gate.example.net:7000"
    pub url: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Block rate (percent of the sliding window) that triggers escalation
    pub threshold_percent: f64,

    /// Consecutive failures that trigger escalation
    pub threshold_count: u32,

    /// Length of the sliding block-rate window (seconds)
    pub window_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_escalate: true,
            url: None,
            username: None,
            password: None,
            threshold_percent: 2.0,
            threshold_count: 10,
            window_secs: 300,
        }
    }
}

impl ProxyConfig {
    /// Whether a proxy pool is available to escalate to
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Returns the pool URL with credentials embedded, if any
    pub fn pool_url(&self) -> Option<String> {
        let raw = self.url.as_deref().filter(|u| !u.is_empty())?;
        let mut url = Url::parse(raw).ok()?;
        if let Some(username) = &self.username {
            // set_username only fails for cannot-be-a-base URLs, which validation rejects
            let _ = url.set_username(username);
            let _ = url.set_password(self.password.as_deref());
        }
        Some(url.to_string())
    }

    /// Returns the pool URL with any password masked, for logging
    pub fn redacted_url(&self) -> String {
        match self.pool_url().and_then(|u| Url::parse(&u).ok()) {
            Some(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            None => "<none>".to_string(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Pre-emption notice polling
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InterruptionConfig {
    /// Poll the pre-emption notice endpoint
    pub enabled: bool,

    pub poll_interval_secs: u64,

    /// Endpoint that answers 200 once a termination is scheduled
    pub notice_url: String,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: 5,
            notice_url: "http://169.254.169.254/latest/meta-data/spot/instance-action".to_string(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Directory receiving export snapshots
    #[serde(rename = "export-dir")]
    pub export_dir: String,

    /// Directory receiving enumeration manifests
    #[serde(rename = "manifest-dir")]
    pub manifest_dir: String,
}

/// One retailer profile
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetailerConfig {
    /// Short retailer key, e.g. "target"
    pub name: String,

    /// Extractor implementation to use
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Catalog root handed to enumeration (a sitemap index for "sitemap")
    pub root_url: String,

    /// Maximum in-flight scrape operations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Regex whose first capture group is the product id in a product URL
    pub id_pattern: Option<String>,

    /// Only child sitemaps whose URL contains this substring are followed
    pub sitemap_filter: Option<String>,

    /// Fields a record must carry to count as complete
    #[serde(default)]
    pub critical_fields: Vec<String>,
}

fn default_kind() -> String {
    "sitemap".to_string()
}

fn default_concurrency() -> usize {
    10
}
