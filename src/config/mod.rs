//! Configuration module for Catalog-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files,
//! plus the `HARVEST_*` environment overrides. The resulting [`Config`] is built
//! once at startup and shared immutably with every component.
//!
//! # Example
//!
//! ```no_run
//! use catalog_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Batch size: {}", config.harvest.batch_size);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CircuitBreakerConfig, Config, HarvestConfig, InterruptionConfig, OutputConfig, ProxyConfig,
    RateLimitConfig, RetailerConfig, RetryConfig,
};

// Re-export parser functions
pub use parser::{
    apply_env_overrides, compute_config_hash, load_config, load_config_with_hash, parse_config,
};
