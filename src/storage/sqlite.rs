//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::state::ProductStatus;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    EnumerationCountRecord, ErrorRecord, IncompleteProductRecord, ProductFields, ProductRecord,
    RescrapeTarget, RunStatus, RunTotals, ScrapeRunRecord,
};
use crate::HarvestError;
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

const RUN_COLUMNS: &str = "id, retailer, started_at, completed_at, status, total_attempted,
     total_success, total_failed, block_rate_percent, proxy_used, config_hash";

const PRODUCT_COLUMNS: &str =
    "retailer, product_id, product_url, fields, status, scrape_run_id, scraped_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Concurrent scrape tasks and a second process may share the file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Opens a second, read-only connection to an existing database
    ///
    /// WAL mode lets this connection read while the writer connection keeps
    /// committing, so long reads such as export snapshots never hold up
    /// scrape tasks.
    pub fn open_reader(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapeRunRecord> {
    Ok(ScrapeRunRecord {
        id: row.get(0)?,
        retailer: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
        total_attempted: row.get::<_, i64>(5)? as u64,
        total_success: row.get::<_, i64>(6)? as u64,
        total_failed: row.get::<_, i64>(7)? as u64,
        block_rate_percent: row.get(8)?,
        proxy_used: row.get(9)?,
        config_hash: row.get(10)?,
    })
}

/// Raw product columns; the fields JSON is decoded outside the row closure
struct ProductRow {
    retailer: String,
    product_id: String,
    product_url: String,
    fields: String,
    status: String,
    scrape_run_id: i64,
    scraped_at: String,
}

fn product_row(row: &Row<'_>) -> rusqlite::Result<ProductRow> {
    Ok(ProductRow {
        retailer: row.get(0)?,
        product_id: row.get(1)?,
        product_url: row.get(2)?,
        fields: row.get(3)?,
        status: row.get(4)?,
        scrape_run_id: row.get(5)?,
        scraped_at: row.get(6)?,
    })
}

impl ProductRow {
    fn into_record(self) -> StorageResult<ProductRecord> {
        let fields: ProductFields = serde_json::from_str(&self.fields)?;
        Ok(ProductRecord {
            retailer: self.retailer,
            product_id: self.product_id,
            product_url: self.product_url,
            fields,
            status: ProductStatus::from_db_string(&self.status).unwrap_or(ProductStatus::Partial),
            scrape_run_id: self.scrape_run_id,
            scraped_at: self.scraped_at,
        })
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_scrape_run(
        &mut self,
        retailer: &str,
        proxy_used: bool,
        config_hash: &str,
    ) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO scrape_runs (retailer, started_at, status, proxy_used, config_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                retailer,
                now,
                RunStatus::Running.to_db_string(),
                proxy_used,
                config_hash
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finalize_scrape_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        totals: &RunTotals,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE scrape_runs
             SET completed_at = ?1, status = ?2, total_attempted = ?3, total_success = ?4,
                 total_failed = ?5, block_rate_percent = ?6, proxy_used = ?7
             WHERE id = ?8 AND completed_at IS NULL",
            params![
                now,
                status.to_db_string(),
                totals.total_attempted as i64,
                totals.total_success as i64,
                totals.total_failed as i64,
                totals.block_rate_percent,
                totals.proxy_used,
                run_id
            ],
        )?;

        if updated == 0 {
            // Distinguish a missing run from a second finalize
            self.get_scrape_run(run_id)?;
            return Err(StorageError::RunAlreadyFinalized(run_id));
        }

        Ok(())
    }

    fn get_scrape_run(&self, run_id: i64) -> StorageResult<ScrapeRunRecord> {
        let sql = format!("SELECT {} FROM scrape_runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![run_id], run_from_row)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_scrape_runs(&self, retailer: &str) -> StorageResult<Vec<ScrapeRunRecord>> {
        let sql = format!(
            "SELECT {} FROM scrape_runs WHERE retailer = ?1 ORDER BY id DESC",
            RUN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![retailer], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ===== Product Management =====

    fn upsert_product(&mut self, product: &ProductRecord) -> StorageResult<()> {
        let fields = serde_json::to_string(&product.fields)?;
        self.conn.execute(
            "INSERT INTO products (retailer, product_id, product_url, title, fields, status,
                                   scrape_run_id, scraped_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(retailer, product_id) DO UPDATE SET
                product_url = excluded.product_url,
                title = excluded.title,
                fields = excluded.fields,
                status = excluded.status,
                scrape_run_id = excluded.scrape_run_id,
                scraped_at = excluded.scraped_at",
            params![
                product.retailer,
                product.product_id,
                product.product_url,
                product.title(),
                fields,
                product.status.to_db_string(),
                product.scrape_run_id,
                product.scraped_at
            ],
        )?;
        Ok(())
    }

    fn get_product(
        &self,
        retailer: &str,
        product_id: &str,
    ) -> StorageResult<Option<ProductRecord>> {
        let sql = format!(
            "SELECT {} FROM products WHERE retailer = ?1 AND product_id = ?2",
            PRODUCT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![retailer, product_id], product_row)
            .optional()?;

        row.map(ProductRow::into_record).transpose()
    }

    fn completed_product_ids(&self, retailer: &str) -> StorageResult<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT product_id FROM products WHERE retailer = ?1 AND status = ?2")?;

        let ids = stmt
            .query_map(
                params![retailer, ProductStatus::Success.to_db_string()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(ids)
    }

    fn count_products(&self, retailer: &str, status: Option<ProductStatus>) -> StorageResult<u64> {
        let count: i64 = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM products WHERE retailer = ?1 AND status = ?2",
                params![retailer, status.to_db_string()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM products WHERE retailer = ?1",
                params![retailer],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    fn for_each_product(
        &self,
        retailer: &str,
        visit: &mut dyn FnMut(ProductRecord) -> StorageResult<()>,
    ) -> StorageResult<u64> {
        let sql = format!(
            "SELECT {} FROM products WHERE retailer = ?1 ORDER BY product_id",
            PRODUCT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![retailer], product_row)?;

        let mut visited = 0;
        for row in rows {
            visit(row?.into_record()?)?;
            visited += 1;
        }

        Ok(visited)
    }

    // ===== Incomplete Records =====

    fn upsert_incomplete(
        &mut self,
        retailer: &str,
        product_id: &str,
        missing_fields: &BTreeSet<String>,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let missing = serde_json::to_string(missing_fields)?;
        self.conn.execute(
            "INSERT INTO incomplete_products (retailer, product_id, missing_fields, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(retailer, product_id) DO UPDATE SET
                missing_fields = excluded.missing_fields,
                rescrape_attempted = 1,
                recorded_at = excluded.recorded_at",
            params![retailer, product_id, missing, now],
        )?;
        Ok(())
    }

    fn clear_incomplete(&mut self, retailer: &str, product_id: &str) -> StorageResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM incomplete_products WHERE retailer = ?1 AND product_id = ?2",
            params![retailer, product_id],
        )?;
        Ok(removed > 0)
    }

    fn get_incomplete(&self, retailer: &str) -> StorageResult<Vec<IncompleteProductRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT retailer, product_id, missing_fields, rescrape_attempted, recorded_at
             FROM incomplete_products WHERE retailer = ?1 ORDER BY product_id",
        )?;

        let rows = stmt
            .query_map(params![retailer], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (retailer, product_id, missing, rescrape_attempted, recorded_at) in rows {
            records.push(IncompleteProductRecord {
                retailer,
                product_id,
                missing_fields: serde_json::from_str(&missing)?,
                rescrape_attempted,
                recorded_at,
            });
        }

        Ok(records)
    }

    fn pending_rescrapes(&self, retailer: &str) -> StorageResult<Vec<RescrapeTarget>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.product_id, p.product_url
             FROM incomplete_products i
             JOIN products p ON p.retailer = i.retailer AND p.product_id = i.product_id
             WHERE i.retailer = ?1 AND i.rescrape_attempted = 0
             ORDER BY i.product_id",
        )?;

        let targets = stmt
            .query_map(params![retailer], |row| {
                Ok(RescrapeTarget {
                    product_id: row.get(0)?,
                    product_url: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    // ===== Error Log =====

    fn log_error(&mut self, error: &ErrorRecord) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO errors (retailer, url, error_type, message, timestamp, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                error.retailer,
                error.url,
                error.error_type,
                error.message,
                now,
                error.run_id
            ],
        )?;
        Ok(())
    }

    fn count_errors(&self, retailer: &str, run_id: Option<i64>) -> StorageResult<u64> {
        let count: i64 = match run_id {
            Some(run_id) => self.conn.query_row(
                "SELECT COUNT(*) FROM errors WHERE retailer = ?1 AND run_id = ?2",
                params![retailer, run_id],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM errors WHERE retailer = ?1",
                params![retailer],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    fn get_error_summary(&self, retailer: &str) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT error_type, COUNT(*) AS n FROM errors WHERE retailer = ?1
             GROUP BY error_type ORDER BY n DESC, error_type",
        )?;

        let summary = stmt
            .query_map(params![retailer], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(summary)
    }

    // ===== Enumeration Audit =====

    fn record_enumeration_count(
        &mut self,
        retailer: &str,
        method: &str,
        count: u64,
        notes: Option<&str>,
    ) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO enumeration_counts (retailer, method, count, timestamp, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![retailer, method, count as i64, now, notes],
        )?;
        Ok(())
    }

    fn get_enumeration_counts(
        &self,
        retailer: &str,
    ) -> StorageResult<Vec<EnumerationCountRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT retailer, method, count, timestamp, notes
             FROM enumeration_counts WHERE retailer = ?1 ORDER BY id DESC",
        )?;

        let counts = stmt
            .query_map(params![retailer], |row| {
                Ok(EnumerationCountRecord {
                    retailer: row.get(0)?,
                    method: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                    timestamp: row.get(3)?,
                    notes: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(counts)
    }

    // ===== Statistics =====

    fn list_retailers(&self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT retailer FROM scrape_runs
             UNION
             SELECT retailer FROM products
             ORDER BY retailer",
        )?;

        let retailers = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(retailers)
    }
}
