//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests made by the built-in extractor:
//! - Building direct and proxied HTTP clients
//! - GET requests for product pages and sitemaps
//! - Status and network error classification

use crate::config::{HarvestConfig, ProxyConfig};
use crate::extractor::{ExtractError, FailureKind, ScrapeFailure};
use crate::state::FetchMode;
use reqwest::{Client, Proxy, StatusCode};
use std::time::Duration;

/// Tracing target for proxy failures, which are always logged loudly
pub const PROXY_LOG_TARGET: &str = "catalog_harvest::proxy";

/// Result of fetching a product page
#[derive(Debug)]
pub enum PageFetch {
    /// Page body fetched with a 2xx status
    Success {
        /// Final URL after redirects
        final_url: String,
        /// HTTP status code
        status_code: u16,
        /// Page body content
        body: String,
    },

    /// 404 or 410
    NotFound,

    /// Any classified failure
    Failed(ScrapeFailure),
}

/// The direct client plus, when a proxy is configured, a proxied one
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub direct: Client,
    pub proxied: Option<Client>,
}

impl HttpClients {
    /// Builds both clients from configuration
    ///
    /// # Arguments
    ///
    /// * `harvest` - Timeout and user agent settings
    /// * `proxy` - Proxy pool settings; ignored unless configured
    ///
    /// # Returns
    ///
    /// * `Ok(HttpClients)` - Clients ready for use
    /// * `Err(reqwest::Error)` - A client or the proxy URL was invalid
    pub fn from_config(harvest: &HarvestConfig, proxy: &ProxyConfig) -> Result<Self, reqwest::Error> {
        let direct = build_http_client(harvest, None)?;
        let proxied = match proxy.pool_url() {
            Some(pool) if proxy.is_configured() => {
                Some(build_http_client(harvest, Some(Proxy::all(pool)?))?)
            }
            _ => None,
        };
        Ok(Self { direct, proxied })
    }

    /// Picks the client for a routing mode
    ///
    /// Falls back to the direct client when no proxy is configured.
    pub fn for_mode(&self, mode: FetchMode) -> &Client {
        match (mode, &self.proxied) {
            (FetchMode::Proxied, Some(client)) => client,
            _ => &self.direct,
        }
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `harvest` - The harvest configuration (user agent, timeout)
/// * `proxy` - Optional proxy every request is routed through
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(
    harvest: &HarvestConfig,
    proxy: Option<Proxy>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .user_agent(harvest.user_agent.clone())
        .timeout(harvest.request_timeout())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy);
    }

    builder.build()
}

/// Maps a non-success HTTP status to an outcome
///
/// # Returns
///
/// * `None` - 404/410, the product does not exist
/// * `Some(kind)` - The failure kind for any other non-2xx status
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    match status.as_u16() {
        404 | 410 => None,
        403 | 429 => Some(FailureKind::Blocked),
        407 => Some(FailureKind::ProxyAuth),
        408 => Some(FailureKind::Timeout),
        s if s >= 500 => Some(FailureKind::Transient),
        _ => Some(FailureKind::Parse),
    }
}

fn classify_reqwest_error(e: &reqwest::Error, mode: FetchMode) -> FailureKind {
    if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_connect() && mode.is_proxied() {
        FailureKind::ProxyAuth
    } else if e.is_decode() {
        FailureKind::Parse
    } else {
        FailureKind::Transient
    }
}

/// Fetches a product page and classifies the result
///
/// # Classification
///
/// | Condition | Outcome |
/// |-----------|---------|
/// | HTTP 2xx | Success |
/// | HTTP 404 / 410 | NotFound |
/// | HTTP 403 / 429 | Blocked |
/// | HTTP 407 | ProxyAuth |
/// | HTTP 5xx | Transient |
/// | Timeout | Timeout |
/// | Connection error while proxied | ProxyAuth |
/// | Other connection error | Transient |
///
/// Failures while proxied are also logged on [`PROXY_LOG_TARGET`].
///
/// # Arguments
///
/// * `client` - The HTTP client to use
/// * `url` - The URL to fetch
/// * `mode` - How the client routes requests
pub async fn fetch_page(client: &Client, url: &str, mode: FetchMode) -> PageFetch {
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            let kind = classify_reqwest_error(&e, mode);
            if mode.is_proxied() {
                tracing::error!(
                    target: PROXY_LOG_TARGET,
                    "Proxied request to {} failed ({}): {}",
                    url,
                    kind,
                    e
                );
            }
            return PageFetch::Failed(ScrapeFailure::new(kind, e.to_string()));
        }
    };

    let status = response.status();
    let final_url = response.url().to_string();

    if !status.is_success() {
        return match classify_status(status) {
            None => PageFetch::NotFound,
            Some(kind) => {
                if kind == FailureKind::ProxyAuth {
                    tracing::error!(
                        target: PROXY_LOG_TARGET,
                        "Proxy rejected credentials (HTTP 407) for {}",
                        url
                    );
                }
                PageFetch::Failed(ScrapeFailure::new(kind, format!("HTTP {}", status.as_u16())))
            }
        };
    }

    match response.text().await {
        Ok(body) => PageFetch::Success {
            final_url,
            status_code: status.as_u16(),
            body,
        },
        Err(e) => PageFetch::Failed(ScrapeFailure::new(
            classify_reqwest_error(&e, mode),
            e.to_string(),
        )),
    }
}

/// Fetches raw bytes, failing on any non-2xx status
///
/// Used for sitemaps, which may be gzip files rather than encoded responses.
pub async fn fetch_bytes(client: &Client, url: &str) -> Result<Vec<u8>, ExtractError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| ExtractError::Http {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ExtractError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(|source| ExtractError::Http {
        url: url.to_string(),
        source,
    })?;

    Ok(bytes.to_vec())
}
