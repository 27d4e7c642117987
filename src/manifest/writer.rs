//! Append-only manifest writer

use super::{manifest_file_name, ManifestEntry, ManifestError, MANIFEST_COLUMNS};
use chrono::Local;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Rows buffered between flushes
const FLUSH_EVERY: u64 = 1000;

/// Writes one enumeration pass to a new manifest file
///
/// Rows go to `<name>.partial` until [`ManifestWriter::finish`] renames the
/// file to its final name.
pub struct ManifestWriter {
    final_path: PathBuf,
    partial_path: PathBuf,
    out: csv::Writer<File>,
    rows: u64,
}

impl ManifestWriter {
    /// Creates a new manifest for `retailer` in `dir`
    ///
    /// # Arguments
    ///
    /// * `dir` - The manifest directory (created if missing)
    /// * `retailer` - The retailer name
    ///
    /// # Returns
    ///
    /// * `Ok(ManifestWriter)` - A writer positioned after the header row
    /// * `Err(ManifestError)` - The file could not be created
    pub fn create(dir: &Path, retailer: &str) -> Result<Self, ManifestError> {
        std::fs::create_dir_all(dir).map_err(|e| ManifestError::io(dir, e))?;

        let base = manifest_file_name(retailer, &Local::now().naive_local());
        let mut final_path = dir.join(&base);

        // Two passes in the same second must not share a file
        let mut suffix = 1;
        while final_path.exists() || partial_of(&final_path).exists() {
            let stem = base.trim_end_matches(".csv");
            final_path = dir.join(format!("{}_{}.csv", stem, suffix));
            suffix += 1;
        }

        let partial_path = partial_of(&final_path);
        let file = File::create(&partial_path).map_err(|e| ManifestError::io(&partial_path, e))?;
        let mut out = csv::Writer::from_writer(file);
        out.write_record(MANIFEST_COLUMNS)
            .map_err(|e| ManifestError::csv(&partial_path, e))?;

        tracing::debug!("Writing manifest to {}", partial_path.display());

        Ok(Self {
            final_path,
            partial_path,
            out,
            rows: 0,
        })
    }

    /// Appends one URL
    pub fn append(&mut self, url: &str) -> Result<(), ManifestError> {
        if url.is_empty() || url.contains(['\n', '\r']) {
            return Err(ManifestError::InvalidUrl(url.to_string()));
        }

        let entry = ManifestEntry::new(url);
        self.out
            .write_record([entry.url.as_str(), entry.digest.as_str()])
            .map_err(|e| ManifestError::csv(&self.partial_path, e))?;
        self.rows += 1;

        if self.rows % FLUSH_EVERY == 0 {
            self.out
                .flush()
                .map_err(|e| ManifestError::io(&self.partial_path, e))?;
        }

        Ok(())
    }

    /// Number of data rows written so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// The path the manifest will have once finished
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flushes, syncs and publishes the manifest under its final name
    pub fn finish(self) -> Result<PathBuf, ManifestError> {
        let Self {
            final_path,
            partial_path,
            out,
            rows,
        } = self;

        let file = out
            .into_inner()
            .map_err(|e| ManifestError::io(&partial_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| ManifestError::io(&partial_path, e))?;
        drop(file);

        std::fs::rename(&partial_path, &final_path)
            .map_err(|e| ManifestError::io(&final_path, e))?;

        tracing::info!("Manifest complete: {} ({} rows)", final_path.display(), rows);
        Ok(final_path)
    }
}

fn partial_of(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}
