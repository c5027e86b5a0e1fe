//! Report artifacts.
//!
//! Batch workers write one success and one failure CSV per chunk under
//! chunk-scoped keys; the finalizer concatenates them into the job's final
//! reports. Chunk keys are deterministic and overwritten on re-run, which
//! keeps the whole pipeline idempotent against task retries.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ArtifactError;

/// One line of a success or failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub name: String,
    pub mobile: String,
    /// Message id on success, failure reason otherwise.
    pub detail: String,
}

impl ReportRow {
    pub fn new(name: &str, mobile: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            mobile: mobile.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Report flavor, which fixes the CSV header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Success,
    Failed,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Success => "success",
            ReportKind::Failed => "failed",
        }
    }

    fn header(self) -> [&'static str; 3] {
        match self {
            ReportKind::Success => ["Name", "Mobile", "MessageID"],
            ReportKind::Failed => ["Name", "Mobile", "Reason"],
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ReportKind::Success),
            "failed" => Ok(ReportKind::Failed),
            _ => Err(()),
        }
    }
}

/// Chunk-scoped artifact key: `success_{job}_{start}_{end}.csv`.
pub fn chunk_key(kind: ReportKind, job_id: Uuid, start: usize, end: usize) -> String {
    format!("{}_{job_id}_{start}_{end}.csv", kind.as_str())
}

/// Final merged artifact key: `final_success_{job}.csv`.
pub fn final_key(kind: ReportKind, job_id: Uuid) -> String {
    format!("final_{}_{job_id}.csv", kind.as_str())
}

/// Keyed storage for report artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write (or overwrite) the rows under `key`.
    async fn put(&self, key: &str, kind: ReportKind, rows: &[ReportRow])
    -> Result<(), ArtifactError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError>;

    /// Parse the rows stored under `key`.
    async fn read_rows(&self, key: &str) -> Result<Vec<ReportRow>, ArtifactError>;

    /// Raw bytes under `key`, for the download surface.
    async fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ArtifactError>;
}

// ── Filesystem implementation ───────────────────────────────────────────

/// Artifact store rooted at a local directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        // Keys are generated internally, but the download surface passes
        // them through HTTP — refuse separators outright.
        if key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(ArtifactError::NotFound(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn encode_csv(kind: ReportKind, rows: &[ReportRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(kind.header())?;
    for row in rows {
        writer.write_record([&row.name, &row.mobile, &row.detail])?;
    }
    writer
        .into_inner()
        .map_err(|e| e.into_error().into())
}

fn decode_csv(bytes: &[u8]) -> Result<Vec<ReportRow>, csv::Error> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(ReportRow {
            name: record.get(0).unwrap_or_default().to_string(),
            mobile: record.get(1).unwrap_or_default().to_string(),
            detail: record.get(2).unwrap_or_default().to_string(),
        });
    }
    Ok(rows)
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        key: &str,
        kind: ReportKind,
        rows: &[ReportRow],
    ) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArtifactError::Write {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let bytes = encode_csv(kind, rows).map_err(|e| ArtifactError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArtifactError::Write {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // Nothing written yet is an empty listing, not an error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ArtifactError::Read {
                    key: prefix.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ArtifactError::Read {
            key: prefix.to_string(),
            reason: e.to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_rows(&self, key: &str) -> Result<Vec<ReportRow>, ArtifactError> {
        let bytes = self.read_bytes(key).await?;
        decode_csv(&bytes).map_err(|e| ArtifactError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    async fn read_bytes(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(ArtifactError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
