//! Input row sources.
//!
//! A bulk job reads its rows from a `RowSource` — an ordered sequence of
//! column→value mappings. Upload handling and spreadsheet parsing live
//! outside this crate; the CSV implementation here reads a server-side file
//! by locator, and the in-memory implementation backs tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::SourceError;

/// One input row: column name → cell value.
pub type Row = HashMap<String, String>;

/// An ordered, re-readable source of input rows.
///
/// Workers re-open the source per chunk rather than holding the full row set
/// in memory across task boundaries, so `read_all` may be called many times
/// for one job and must return the same rows each time.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Stable locator for logging and re-scheduling.
    fn locator(&self) -> &str;

    /// Column names, in file order.
    async fn header(&self) -> Result<Vec<String>, SourceError>;

    /// Every row in order.
    async fn read_all(&self) -> Result<Vec<Row>, SourceError>;

    /// The half-open slice `[start, end)` of the row sequence.
    async fn read_slice(&self, start: usize, end: usize) -> Result<Vec<Row>, SourceError> {
        let rows = self.read_all().await?;
        let end = end.min(rows.len());
        let start = start.min(end);
        Ok(rows[start..end].to_vec())
    }
}

// ── CSV file source ─────────────────────────────────────────────────────

/// Row source backed by a CSV file on local storage.
pub struct CsvRowSource {
    path: PathBuf,
    locator: String,
}

impl CsvRowSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let locator = path.display().to_string();
        Self { path, locator }
    }

    /// Parse the whole file. Runs on the blocking pool — CSV parsing is
    /// synchronous I/O.
    async fn parse(&self) -> Result<(Vec<String>, Vec<Row>), SourceError> {
        let path = self.path.clone();
        let locator = self.locator.clone();

        tokio::task::spawn_blocking(move || {
            let mut reader =
                csv::Reader::from_path(&path).map_err(|e| SourceError::Open {
                    locator: locator.clone(),
                    reason: e.to_string(),
                })?;

            let header: Vec<String> = reader
                .headers()
                .map_err(|e| SourceError::Parse {
                    locator: locator.clone(),
                    reason: e.to_string(),
                })?
                .iter()
                .map(|h| h.trim().to_string())
                .collect();

            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record.map_err(|e| SourceError::Parse {
                    locator: locator.clone(),
                    reason: e.to_string(),
                })?;
                let row: Row = header
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.clone(), v.trim().to_string()))
                    .collect();
                rows.push(row);
            }
            Ok((header, rows))
        })
        .await
        .map_err(|e| SourceError::Open {
            locator: self.locator.clone(),
            reason: format!("blocking task failed: {e}"),
        })?
    }
}

#[async_trait]
impl RowSource for CsvRowSource {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn header(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.parse().await?.0)
    }

    async fn read_all(&self) -> Result<Vec<Row>, SourceError> {
        Ok(self.parse().await?.1)
    }
}

// ── In-memory source ────────────────────────────────────────────────────

/// Fixed row source for tests and programmatic submissions.
pub struct MemoryRowSource {
    header: Vec<String>,
    rows: Vec<Row>,
}

impl MemoryRowSource {
    pub fn new(header: Vec<String>, rows: Vec<Row>) -> Self {
        Self { header, rows }
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    fn locator(&self) -> &str {
        "memory"
    }

    async fn header(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.header.clone())
    }

    async fn read_all(&self) -> Result<Vec<Row>, SourceError> {
        Ok(self.rows.clone())
    }
}
