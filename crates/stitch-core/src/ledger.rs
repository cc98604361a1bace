//! Exactly-once guard over source files.
//!
//! A file counts as committed as soon as one of its rows exists in the
//! `events` table; there is no separate bookkeeping that could disagree
//! with the facts. Files are assumed immutable once produced: a file
//! rewritten in place under the same name is not detected.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::source::SourceFile;

/// One committed source file, for operator listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommittedFile {
    pub source_file_name: String,
    pub row_count: i64,
    pub source_file_timestamp_us: i64,
    pub batch_id: String,
}

/// Read-only view over which source files have been committed.
pub struct FileLedger<'conn> {
    conn: &'conn Connection,
}

impl<'conn> FileLedger<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Returns `true` when no committed event carries `file_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn is_new(&self, file_name: &str) -> Result<bool> {
        let committed: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM events WHERE source_file_name = ?1)",
                params![file_name],
                |row| row.get(0),
            )
            .with_context(|| format!("check ledger for {file_name}"))?;
        Ok(!committed)
    }

    /// Keep only the files of a connector listing that are not committed yet.
    ///
    /// Duplicate names inside the listing itself collapse to the first entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn filter_new(&self, listing: Vec<SourceFile>) -> Result<Vec<SourceFile>> {
        let mut seen = std::collections::HashSet::new();
        let mut fresh = Vec::with_capacity(listing.len());
        for file in listing {
            if !seen.insert(file.name.clone()) {
                continue;
            }
            if self.is_new(&file.name)? {
                fresh.push(file);
            } else {
                tracing::debug!(file = %file.name, "skipping already committed source file");
            }
        }
        Ok(fresh)
    }

    /// All committed files, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn committed_files(&self) -> Result<Vec<CommittedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_file_name, COUNT(*), MIN(source_file_timestamp_us), MIN(batch_id)
             FROM events
             GROUP BY source_file_name
             ORDER BY source_file_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CommittedFile {
                    source_file_name: row.get(0)?,
                    row_count: row.get(1)?,
                    source_file_timestamp_us: row.get(2)?,
                    batch_id: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list committed files")?;
        Ok(rows)
    }
}
