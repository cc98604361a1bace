//! Source connector boundary.
//!
//! The connector lists an append-only collection of immutable files and
//! reads each one into [`RawEvent`] rows tagged with the file's name and
//! timestamp. [`JsonlDirSource`] reads a local directory of JSON-lines files;
//! [`MemorySource`] serves rows held in memory.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ErrorCode;
use crate::event::{EventKind, RawEvent, to_micros};

/// Errors surfaced by a source connector.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source collection cannot be listed or a file cannot be opened.
    #[error("source unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line of a source file is not a valid event record.
    #[error("{file}:{line}: invalid event record: {source}")]
    Parse {
        file: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The listing named a file the connector does not know.
    #[error("source file not found: {0}")]
    UnknownFile(String),
}

impl SourceError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. } | Self::UnknownFile(_) => ErrorCode::SourceUnavailable,
            Self::Parse { .. } => ErrorCode::SourceParseError,
        }
    }
}

/// One entry of a connector listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Stable file name, the exactly-once identity of the file.
    pub name: String,
    /// File timestamp in epoch microseconds.
    pub modified_us: i64,
}

/// Supplies raw events from an external, append-only file collection.
pub trait SourceConnector {
    /// List every file currently in the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be listed.
    fn list_files(&self) -> Result<Vec<SourceFile>, SourceError>;

    /// Read all rows of one listed file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    fn read_file(&self, file: &SourceFile) -> Result<Vec<RawEvent>, SourceError>;
}

/// Wire shape of one JSON-lines record.
#[derive(Debug, Deserialize)]
struct SourceRecord {
    event_time: DateTime<Utc>,
    #[serde(default)]
    ad_id: Option<i64>,
    session_id: String,
    viewer_id: String,
    event_type: i64,
    channel_id: i64,
}

impl SourceRecord {
    fn into_raw(self, file: &SourceFile) -> RawEvent {
        RawEvent {
            event_time_us: to_micros(self.event_time),
            ad_id: self.ad_id,
            session_id: self.session_id,
            viewer_id: self.viewer_id,
            event_type: EventKind(self.event_type),
            channel_id: self.channel_id,
            source_file_name: file.name.clone(),
            source_file_timestamp_us: file.modified_us,
        }
    }
}

/// Reads `*.<extension>` JSON-lines files from a directory.
#[derive(Debug, Clone)]
pub struct JsonlDirSource {
    dir: PathBuf,
    extension: String,
}

impl JsonlDirSource {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    /// Directory this connector reads from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unavailable(path: &Path, source: std::io::Error) -> SourceError {
        SourceError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl SourceConnector for JsonlDirSource {
    fn list_files(&self) -> Result<Vec<SourceFile>, SourceError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::unavailable(&self.dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::unavailable(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            let metadata = entry
                .metadata()
                .map_err(|e| Self::unavailable(&path, e))?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping source file with non-UTF-8 name");
                continue;
            };
            let modified_us = metadata
                .modified()
                .map(|ts| to_micros(DateTime::<Utc>::from(ts)))
                .unwrap_or(0);
            files.push(SourceFile {
                name: name.to_string(),
                modified_us,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn read_file(&self, file: &SourceFile) -> Result<Vec<RawEvent>, SourceError> {
        let path = self.dir.join(&file.name);
        let handle = fs::File::open(&path).map_err(|e| Self::unavailable(&path, e))?;

        let mut rows = Vec::new();
        for (idx, line) in BufReader::new(handle).lines().enumerate() {
            let line = line.map_err(|e| Self::unavailable(&path, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: SourceRecord =
                serde_json::from_str(trimmed).map_err(|source| SourceError::Parse {
                    file: file.name.clone(),
                    line: idx + 1,
                    source,
                })?;
            rows.push(record.into_raw(file));
        }
        Ok(rows)
    }
}

/// In-memory connector, useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<(SourceFile, Vec<RawEvent>)>,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. Row file metadata is overwritten to match the file.
    pub fn push_file(&mut self, name: &str, modified_us: i64, rows: Vec<RawEvent>) {
        let file = SourceFile {
            name: name.to_string(),
            modified_us,
        };
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.source_file_name = file.name.clone();
                row.source_file_timestamp_us = modified_us;
                row
            })
            .collect();
        self.files.push((file, rows));
    }
}

impl SourceConnector for MemorySource {
    fn list_files(&self) -> Result<Vec<SourceFile>, SourceError> {
        Ok(self.files.iter().map(|(file, _)| file.clone()).collect())
    }

    fn read_file(&self, file: &SourceFile) -> Result<Vec<RawEvent>, SourceError> {
        self.files
            .iter()
            .find(|(listed, _)| listed.name == file.name)
            .map(|(_, rows)| rows.clone())
            .ok_or_else(|| SourceError::UnknownFile(file.name.clone()))
    }
}
