//! Extractor boundary
//!
//! An extractor knows how to discover the products of one retailer and how
//! to fetch a single product. The orchestration engine never looks inside a
//! page; it only sees [`DiscoveredItem`]s and [`ScrapeOutcome`]s.
//!
//! Extractors are looked up by retailer in an [`ExtractorRegistry`], which
//! builds them from configuration by their `kind`.

mod fetcher;
mod parser;
mod registry;
mod sitemap;

pub use fetcher::{build_http_client, classify_status, fetch_bytes, fetch_page, HttpClients, PageFetch};
pub use parser::{parse_product_page, ParsedProduct};
pub use registry::{ExtractorFactory, ExtractorRegistry};
pub use sitemap::{parse_sitemap, SitemapDocument, SitemapExtractor, SITEMAP_METHOD};

use crate::state::FetchMode;
use crate::storage::ProductFields;
use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;
use reqwest::Client;
use std::fmt;
use thiserror::Error;

/// Extractor kinds that can be built from configuration
pub const KNOWN_KINDS: &[&str] = &["sitemap"];

/// Errors raised while enumerating or building extractors
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("HTTP error fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected HTTP status {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Unknown extractor kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// A product discovered during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub url: String,
    pub product_id: String,

    /// Name of the discovery method, recorded in the enumeration audit
    pub method: String,
}

/// Per-request context handed to [`Extractor::scrape_one`]
#[derive(Debug, Clone)]
pub struct FetchContext {
    /// Client routed according to `mode`
    pub client: Client,
    pub mode: FetchMode,

    /// 1-based attempt number within the retry policy
    pub attempt: u32,
}

/// Fields recovered from one product page
#[derive(Debug, Clone, Default)]
pub struct ScrapedProduct {
    pub fields: ProductFields,

    /// The page was fetched but only part of the record could be recovered
    pub partial: bool,
}

/// Why a single scrape failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network hiccup or 5xx; worth retrying
    Transient,
    Timeout,

    /// 403/429 or an anti-bot interstitial
    Blocked,

    /// The page came back but could not be understood
    Parse,

    /// The proxy rejected our credentials or could not be reached
    ProxyAuth,
}

impl FailureKind {
    /// The `error_type` stored in the error log
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::Parse => "parse",
            Self::ProxyAuth => "proxy_auth",
        }
    }

    /// Whether the failure counts toward block statistics
    ///
    /// Proxy failures point at misconfiguration rather than the target, but
    /// they still count as blocks.
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Blocked | Self::ProxyAuth)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified scrape failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ScrapeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of scraping one product
#[derive(Debug, Clone)]
pub enum ScrapeOutcome {
    Found(ScrapedProduct),

    /// The retailer says the product does not exist; terminal, not a failure
    NotFound,
    Failed(ScrapeFailure),
}

/// Retailer-specific discovery and scraping
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Retailer this extractor serves
    fn retailer(&self) -> &str;

    /// Lazily discovers products starting from `root`
    ///
    /// A failed sub-index yields an `Err` item; the stream keeps going.
    fn enumerate<'a>(&'a self, root: &'a str)
        -> BoxStream<'a, Result<DiscoveredItem, ExtractError>>;

    /// Derives the product id of a manifest URL
    fn product_id(&self, url: &str) -> Option<String> {
        last_path_segment(url)
    }

    /// Fetches and parses a single product
    async fn scrape_one(&self, url: &str, product_id: &str, ctx: &FetchContext) -> ScrapeOutcome;

    /// Releases held resources (browsers, sessions); called once at shutdown
    async fn release(&self) {}
}

/// Maps product URLs to ids with a configured regex
///
/// The first capture group is the id. URLs the pattern does not match fall
/// back to their last non-empty path segment when no pattern is configured,
/// and are rejected otherwise.
#[derive(Debug, Clone)]
pub struct ProductIdPattern {
    pattern: Option<Regex>,
}

impl ProductIdPattern {
    pub fn new(pattern: Option<&str>) -> Result<Self, ExtractError> {
        let pattern = pattern.map(Regex::new).transpose()?;
        Ok(Self { pattern })
    }

    pub fn extract(&self, url: &str) -> Option<String> {
        match &self.pattern {
            Some(re) => re
                .captures(url)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
            None => last_path_segment(url),
        }
    }
}

/// Last non-empty path segment of a URL, without query or fragment
pub fn last_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(|segment| segment.to_string())
}
