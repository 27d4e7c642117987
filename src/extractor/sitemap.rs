//! Generic sitemap-driven extractor
//!
//! Enumerates a catalog by walking a sitemap index breadth-first (child
//! sitemaps may be gzipped) and scrapes product pages for their HTML
//! metadata.

use crate::config::RetailerConfig;
use crate::extractor::fetcher::{fetch_bytes, fetch_page, PageFetch};
use crate::extractor::parser::parse_product_page;
use crate::extractor::{
    DiscoveredItem, ExtractError, Extractor, FailureKind, FetchContext, ProductIdPattern,
    ScrapeFailure, ScrapeOutcome, ScrapedProduct,
};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use std::collections::{HashSet, VecDeque};
use std::io::{Cursor, Read};
use url::Url;

/// Discovery method recorded for sitemap-sourced items
pub const SITEMAP_METHOD: &str = "sitemap";

/// The `<loc>` entries of one sitemap document
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SitemapDocument {
    /// Child sitemaps listed by a sitemap index
    pub sitemaps: Vec<String>,

    /// Page URLs listed by a urlset
    pub urls: Vec<String>,
}

impl SitemapDocument {
    /// Whether the document is an index of other sitemaps
    pub fn is_index(&self) -> bool {
        !self.sitemaps.is_empty()
    }
}

/// Extractor for retailers whose catalog is published as sitemaps
pub struct SitemapExtractor {
    retailer: String,
    client: Client,
    ids: ProductIdPattern,
    sitemap_filter: Option<String>,
}

impl SitemapExtractor {
    /// Builds the extractor for one retailer profile
    ///
    /// # Arguments
    ///
    /// * `retailer` - The retailer profile
    /// * `client` - Direct client used while enumerating
    pub fn new(retailer: &RetailerConfig, client: Client) -> Result<Self, ExtractError> {
        Ok(Self {
            retailer: retailer.name.clone(),
            client,
            ids: ProductIdPattern::new(retailer.id_pattern.as_deref())?,
            sitemap_filter: retailer.sitemap_filter.clone(),
        })
    }

    async fn load_sitemap(&self, url: &str) -> Result<SitemapDocument, ExtractError> {
        let bytes = fetch_bytes(&self.client, url).await?;
        parse_sitemap(url, &decode_sitemap(url, &bytes)?)
    }

    /// Queues child sitemaps or emits product items from one sitemap
    fn expand(&self, url: &str, document: SitemapDocument, walk: &mut Walk<'_>) {
        if !document.urls.is_empty() && document.is_index() {
            tracing::warn!("Sitemap {} mixes <url> and <sitemap> entries", url);
        }

        for child in document.sitemaps {
            let wanted = self
                .sitemap_filter
                .as_deref()
                .map_or(true, |filter| child.contains(filter));
            if wanted && walk.visited.insert(child.clone()) {
                walk.queue.push_back(child);
            }
        }

        let mut matched = 0;
        for loc in document.urls {
            if let Some(product_id) = self.ids.extract(&loc) {
                matched += 1;
                walk.pending.push_back(Ok(DiscoveredItem {
                    url: loc,
                    product_id,
                    method: SITEMAP_METHOD.to_string(),
                }));
            }
        }
        tracing::debug!("Sitemap {} yielded {} product URLs", url, matched);
    }
}

/// Breadth-first walk state
struct Walk<'a> {
    extractor: &'a SitemapExtractor,
    queue: VecDeque<String>,
    visited: HashSet<String>,
    pending: VecDeque<Result<DiscoveredItem, ExtractError>>,
}

#[async_trait]
impl Extractor for SitemapExtractor {
    fn retailer(&self) -> &str {
        &self.retailer
    }

    fn enumerate<'a>(
        &'a self,
        root: &'a str,
    ) -> BoxStream<'a, Result<DiscoveredItem, ExtractError>> {
        let walk = Walk {
            extractor: self,
            queue: VecDeque::from([root.to_string()]),
            visited: HashSet::from([root.to_string()]),
            pending: VecDeque::new(),
        };

        stream::unfold(walk, |mut walk| async move {
            loop {
                if let Some(item) = walk.pending.pop_front() {
                    return Some((item, walk));
                }

                let url = walk.queue.pop_front()?;
                match walk.extractor.load_sitemap(&url).await {
                    Ok(document) => {
                        let extractor = walk.extractor;
                        extractor.expand(&url, document, &mut walk);
                    }
                    Err(e) => return Some((Err(e), walk)),
                }
            }
        })
        .boxed()
    }

    fn product_id(&self, url: &str) -> Option<String> {
        self.ids.extract(url)
    }

    async fn scrape_one(&self, url: &str, product_id: &str, ctx: &FetchContext) -> ScrapeOutcome {
        let (final_url, body) = match fetch_page(&ctx.client, url, ctx.mode).await {
            PageFetch::Success {
                final_url, body, ..
            } => (final_url, body),
            PageFetch::NotFound => return ScrapeOutcome::NotFound,
            PageFetch::Failed(failure) => return ScrapeOutcome::Failed(failure),
        };

        let base = match Url::parse(&final_url).or_else(|_| Url::parse(url)) {
            Ok(base) => base,
            Err(e) => {
                return ScrapeOutcome::Failed(ScrapeFailure::new(
                    FailureKind::Parse,
                    format!("unparseable URL {}: {}", url, e),
                ))
            }
        };

        let parsed = parse_product_page(&body, &base);
        if parsed.fields.is_empty() {
            return ScrapeOutcome::Failed(ScrapeFailure::new(
                FailureKind::Parse,
                "page carries no product metadata",
            ));
        }

        let mut fields = parsed.fields;
        fields.insert("product_id".to_string(), Value::from(product_id));
        fields.insert("url".to_string(), Value::from(url));

        ScrapeOutcome::Found(ScrapedProduct {
            fields,
            partial: !parsed.structured,
        })
    }
}

/// Decodes a sitemap body, inflating gzip content
fn decode_sitemap(url: &str, bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut xml = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut xml)
            .map_err(|e| ExtractError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        return Ok(xml);
    }

    Ok(bytes.to_vec())
}

/// Parses a sitemap or sitemap index
///
/// Reading stops at the first XML error. Entries read before it are kept;
/// a document that fails before yielding any entry is a decode error.
///
/// # Arguments
///
/// * `url` - Where the document came from, for error messages
/// * `xml` - The decoded document
pub fn parse_sitemap(url: &str, xml: &[u8]) -> Result<SitemapDocument, ExtractError> {
    let mut document = SitemapDocument::default();

    for entity in SiteMapReader::new(Cursor::new(xml)) {
        match entity {
            SiteMapEntity::Url(entry) => {
                if let Some(loc) = entry.loc.get_url() {
                    document.urls.push(loc.to_string());
                }
            }
            SiteMapEntity::SiteMap(entry) => {
                if let Some(loc) = entry.loc.get_url() {
                    document.sitemaps.push(loc.to_string());
                }
            }
            SiteMapEntity::Err(e) => {
                if document.urls.is_empty() && document.sitemaps.is_empty() {
                    return Err(ExtractError::Decode {
                        url: url.to_string(),
                        message: format!("{:?}", e),
                    });
                }
                tracing::warn!("Sitemap {} is truncated or malformed: {:?}", url, e);
                break;
            }
        }
    }

    Ok(document)
}
