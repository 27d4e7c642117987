use crate::config::types::{
    CircuitBreakerConfig, Config, HarvestConfig, OutputConfig, ProxyConfig, RateLimitConfig,
    RetailerConfig, RetryConfig,
};
use crate::extractor::KNOWN_KINDS;
use crate::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_harvest_config(&config.harvest)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_retry_config(&config.retry)?;
    validate_circuit_breaker_config(&config.circuit_breaker)?;
    validate_proxy_config(&config.proxy)?;
    validate_output_config(&config.output)?;
    validate_retailers(&config.retailers)?;
    Ok(())
}

fn validate_harvest_config(config: &HarvestConfig) -> Result<(), ConfigError> {
    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "batch-size must be >= 1".to_string(),
        ));
    }

    if config.export_every < 1 {
        return Err(ConfigError::Validation(
            "export-every must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.min_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "rate-limit min-delay-ms ({}) must not exceed max-delay-ms ({})",
            config.min_delay_ms, config.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    // Inline retries are meant to be a small fixed count; longer campaigns go through resume
    if config.max_attempts < 1 || config.max_attempts > 10 {
        return Err(ConfigError::Validation(format!(
            "retry max-attempts must be between 1 and 10, got {}",
            config.max_attempts
        )));
    }
    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(
            "retry base-delay-ms must not exceed max-delay-ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_circuit_breaker_config(config: &CircuitBreakerConfig) -> Result<(), ConfigError> {
    if config.soft_threshold < 1 {
        return Err(ConfigError::Validation(
            "circuit-breaker soft-threshold must be >= 1".to_string(),
        ));
    }

    if config.hard_threshold < config.soft_threshold {
        return Err(ConfigError::Validation(format!(
            "circuit-breaker hard-threshold ({}) must be >= soft-threshold ({})",
            config.hard_threshold, config.soft_threshold
        )));
    }

    Ok(())
}

fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    if let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) {
        let parsed = Url::parse(url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid proxy url: {}", e)))?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl(format!(
                "Proxy url '{}' must include a host",
                url
            )));
        }
    }

    if config.enabled && !config.is_configured() {
        return Err(ConfigError::Validation(
            "proxy is enabled but no proxy url is configured".to_string(),
        ));
    }

    if !(config.threshold_percent > 0.0 && config.threshold_percent <= 100.0) {
        return Err(ConfigError::Validation(format!(
            "proxy threshold-percent must be in (0, 100], got {}",
            config.threshold_percent
        )));
    }

    if config.threshold_count < 1 {
        return Err(ConfigError::Validation(
            "proxy threshold-count must be >= 1".to_string(),
        ));
    }

    if config.window_secs < 1 {
        return Err(ConfigError::Validation(
            "proxy window-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.export_dir.is_empty() {
        return Err(ConfigError::Validation(
            "export-dir cannot be empty".to_string(),
        ));
    }

    if config.manifest_dir.is_empty() {
        return Err(ConfigError::Validation(
            "manifest-dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_retailers(retailers: &[RetailerConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for retailer in retailers {
        validate_retailer_name(&retailer.name)?;

        if !seen.insert(retailer.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Retailer '{}' is configured more than once",
                retailer.name
            )));
        }

        if !KNOWN_KINDS.contains(&retailer.kind.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Retailer '{}' uses unknown extractor kind '{}' (known: {})",
                retailer.name,
                retailer.kind,
                KNOWN_KINDS.join(", ")
            )));
        }

        let root = Url::parse(&retailer.root_url).map_err(|e| {
            ConfigError::InvalidUrl(format!(
                "Invalid root-url for '{}': {}",
                retailer.name, e
            ))
        })?;
        if !matches!(root.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "root-url for '{}' must be http or https",
                retailer.name
            )));
        }

        if retailer.concurrency < 1 || retailer.concurrency > 1000 {
            return Err(ConfigError::Validation(format!(
                "Retailer '{}' concurrency must be between 1 and 1000, got {}",
                retailer.name, retailer.concurrency
            )));
        }

        if let Some(pattern) = &retailer.id_pattern {
            let regex = Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidPattern(format!("'{}' for '{}': {}", pattern, retailer.name, e))
            })?;
            if regex.captures_len() < 2 {
                return Err(ConfigError::InvalidPattern(format!(
                    "'{}' for '{}' must contain a capture group for the product id",
                    pattern, retailer.name
                )));
            }
        }

        if retailer.critical_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "Retailer '{}' lists an empty critical field",
                retailer.name
            )));
        }
    }

    Ok(())
}

/// Retailer names end up in file names and environment variable names
fn validate_retailer_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Validation(
            "retailer name cannot be empty".to_string(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "retailer name must contain only lowercase letters, digits and hyphens, got '{}'",
            name
        )));
    }

    Ok(())
}
