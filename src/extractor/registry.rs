//! Extractor lookup table
//!
//! Extractors are built from retailer profiles by their `kind`. New kinds are
//! added by registering a factory; nothing else in the engine changes.

use crate::config::{Config, RetailerConfig};
use crate::extractor::fetcher::build_http_client;
use crate::extractor::{ExtractError, Extractor, SitemapExtractor};
use crate::HarvestError;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds an extractor for one retailer profile
pub type ExtractorFactory =
    fn(&RetailerConfig, &Config) -> Result<Arc<dyn Extractor>, ExtractError>;

fn build_sitemap(retailer: &RetailerConfig, config: &Config) -> Result<Arc<dyn Extractor>, ExtractError> {
    let client = build_http_client(&config.harvest, None).map_err(|source| ExtractError::Http {
        url: retailer.root_url.clone(),
        source,
    })?;
    Ok(Arc::new(SitemapExtractor::new(retailer, client)?))
}

/// Maps retailer names to their extractors
pub struct ExtractorRegistry {
    factories: HashMap<&'static str, ExtractorFactory>,
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistry {
    /// Creates a registry knowing the built-in kinds and no retailers
    pub fn new() -> Self {
        let mut factories: HashMap<&'static str, ExtractorFactory> = HashMap::new();
        factories.insert("sitemap", build_sitemap);

        Self {
            factories,
            extractors: HashMap::new(),
        }
    }

    /// Builds a registry with one extractor per configured retailer
    pub fn from_config(config: &Config) -> Result<Self, ExtractError> {
        let mut registry = Self::new();
        for retailer in &config.retailers {
            registry.build(retailer, config)?;
        }
        Ok(registry)
    }

    /// Adds or replaces the factory for a kind
    pub fn register_kind(&mut self, kind: &'static str, factory: ExtractorFactory) {
        self.factories.insert(kind, factory);
    }

    /// Builds and registers the extractor for one retailer profile
    pub fn build(&mut self, retailer: &RetailerConfig, config: &Config) -> Result<(), ExtractError> {
        let factory = self
            .factories
            .get(retailer.kind.as_str())
            .ok_or_else(|| ExtractError::UnknownKind(retailer.kind.clone()))?;

        let extractor = factory(retailer, config)?;
        tracing::debug!(
            "Registered {} extractor for {}",
            retailer.kind,
            retailer.name
        );
        self.extractors.insert(retailer.name.clone(), extractor);
        Ok(())
    }

    /// Registers a ready-made extractor under its own retailer name
    pub fn insert(&mut self, extractor: Arc<dyn Extractor>) {
        self.extractors
            .insert(extractor.retailer().to_string(), extractor);
    }

    /// Looks up the extractor for a retailer
    pub fn get(&self, retailer: &str) -> Result<Arc<dyn Extractor>, HarvestError> {
        self.extractors
            .get(retailer)
            .cloned()
            .ok_or_else(|| HarvestError::UnknownRetailer(retailer.to_string()))
    }

    /// Registered retailer names, sorted
    pub fn retailers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.extractors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Calls [`Extractor::release`] on every registered extractor
    pub async fn release_all(&self) {
        for (name, extractor) in &self.extractors {
            tracing::debug!("Releasing extractor for {}", name);
            extractor.release().await;
        }
    }
}
