//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Catalog-Harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per coordinator invocation; restarts append new rows
CREATE TABLE IF NOT EXISTS scrape_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    retailer TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    total_attempted INTEGER NOT NULL DEFAULT 0,
    total_success INTEGER NOT NULL DEFAULT 0,
    total_failed INTEGER NOT NULL DEFAULT 0,
    block_rate_percent REAL NOT NULL DEFAULT 0.0,
    proxy_used INTEGER NOT NULL DEFAULT 0,
    config_hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scrape_runs_retailer ON scrape_runs(retailer);

-- Scraped products, unique per retailer
CREATE TABLE IF NOT EXISTS products (
    retailer TEXT NOT NULL,
    product_id TEXT NOT NULL,
    product_url TEXT NOT NULL,
    title TEXT,
    fields TEXT NOT NULL,
    status TEXT NOT NULL,
    scrape_run_id INTEGER NOT NULL REFERENCES scrape_runs(id),
    scraped_at TEXT NOT NULL,
    PRIMARY KEY (retailer, product_id)
);

CREATE INDEX IF NOT EXISTS idx_products_status ON products(retailer, status);

-- Append-only error log
CREATE TABLE IF NOT EXISTS errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    retailer TEXT NOT NULL,
    url TEXT NOT NULL,
    error_type TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    run_id INTEGER REFERENCES scrape_runs(id)
);

CREATE INDEX IF NOT EXISTS idx_errors_retailer ON errors(retailer, run_id);

-- Products fetched without all critical fields
CREATE TABLE IF NOT EXISTS incomplete_products (
    retailer TEXT NOT NULL,
    product_id TEXT NOT NULL,
    missing_fields TEXT NOT NULL,
    rescrape_attempted INTEGER NOT NULL DEFAULT 0,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (retailer, product_id)
);

-- Completeness audit: how many items each enumeration method produced
CREATE TABLE IF NOT EXISTS enumeration_counts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    retailer TEXT NOT NULL,
    method TEXT NOT NULL,
    count INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_enumeration_counts_retailer ON enumeration_counts(retailer);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
