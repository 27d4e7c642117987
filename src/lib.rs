//! Catalog-Harvest: a resumable product catalog harvester
//!
//! This crate enumerates large retail catalogs into append-only manifests and
//! scrapes them in bounded, resumable batches, escalating to a proxy pool when
//! blocks pile up and stopping cleanly on interruption or a tripped circuit
//! breaker.

pub mod config;
pub mod crawler;
pub mod extractor;
pub mod manifest;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Catalog-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),

    #[error("Extractor error: {0}")]
    Extract(#[from] extractor::ExtractError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown retailer: {0}")]
    UnknownRetailer(String),

    #[error(
        "Circuit breaker tripped for {retailer}: {consecutive_failures} consecutive failures \
         (threshold {threshold})"
    )]
    CircuitBreakerTripped {
        retailer: String,
        consecutive_failures: u32,
        threshold: u32,
    },

    #[error("Storage lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid id pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid environment override {name}: {message}")]
    Environment { name: String, message: String },
}

/// Result type alias for Catalog-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use state::{BlockState, FetchMode, ProductStatus};
