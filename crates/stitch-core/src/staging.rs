//! Transient holding area for one batch of raw events.
//!
//! Rows are tagged with a batch id and discarded with a single
//! `DELETE ... WHERE batch_id = ?`, which is the logical truncate of a
//! batch. Reset is idempotent and safe on an empty batch.

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::event::{EventKind, RawEvent};
use crate::source::SourceFile;

/// Deterministic batch id for a set of new source files.
///
/// The same file set always maps to the same id, so a cycle that crashed
/// after staging replays under the id it staged with.
#[must_use]
pub fn batch_id_for(files: &[SourceFile]) -> String {
    let mut names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
    names.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    let hex = hasher.finalize().to_hex();
    format!("b-{}", &hex[..16])
}

/// A staged row together with its staging sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub staged_id: i64,
    pub raw: RawEvent,
}

/// Staging operations over `staged_events`.
pub struct StagingBuffer<'conn> {
    conn: &'conn Connection,
}

impl<'conn> StagingBuffer<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Stage `rows` under `batch_id`, replacing anything previously staged
    /// under the same id. Returns the number of rows staged.
    ///
    /// The caller provides the transaction boundary; [`crate::cycle`] wraps
    /// this in its own transaction so a half-staged batch never persists.
    ///
    /// # Errors
    ///
    /// Returns an error if any insert fails.
    pub fn stage(&self, batch_id: &str, rows: &[RawEvent]) -> Result<usize> {
        let replaced = self.reset(batch_id)?;
        if replaced > 0 {
            tracing::warn!(batch_id, replaced, "restaging batch left over from an earlier cycle");
        }

        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO staged_events (
                batch_id, event_time_us, ad_id, session_id, viewer_id, event_type,
                channel_id, source_file_name, source_file_timestamp_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for row in rows {
            stmt.execute(params![
                batch_id,
                row.event_time_us,
                row.ad_id,
                row.session_id,
                row.viewer_id,
                row.event_type.code(),
                row.channel_id,
                row.source_file_name,
                row.source_file_timestamp_us,
            ])
            .with_context(|| format!("stage row from {}", row.source_file_name))?;
        }
        Ok(rows.len())
    }

    /// Discard every row staged under `batch_id`. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn reset(&self, batch_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM staged_events WHERE batch_id = ?1", params![batch_id])
            .with_context(|| format!("reset staging batch {batch_id}"))
    }

    /// Discard rows of every batch other than `batch_id`.
    ///
    /// Only one cycle runs at a time, so any other batch is debris from a
    /// cycle that failed before its merge committed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_other_batches(&self, batch_id: &str) -> Result<usize> {
        let purged = self
            .conn
            .execute("DELETE FROM staged_events WHERE batch_id <> ?1", params![batch_id])
            .context("purge stale staging batches")?;
        if purged > 0 {
            tracing::warn!(purged, "discarded staged rows from abandoned batches");
        }
        Ok(purged)
    }

    /// Number of rows staged under `batch_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn len(&self, batch_id: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM staged_events WHERE batch_id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Rows of `batch_id` in merge order: event time, then staging order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn rows(&self, batch_id: &str) -> Result<Vec<StagedRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT staged_id, event_time_us, ad_id, session_id, viewer_id, event_type,
                    channel_id, source_file_name, source_file_timestamp_us
             FROM staged_events
             WHERE batch_id = ?1
             ORDER BY event_time_us, staged_id",
        )?;
        let rows = stmt
            .query_map(params![batch_id], |row| {
                Ok(StagedRow {
                    staged_id: row.get(0)?,
                    raw: RawEvent {
                        event_time_us: row.get(1)?,
                        ad_id: row.get(2)?,
                        session_id: row.get(3)?,
                        viewer_id: row.get(4)?,
                        event_type: EventKind(row.get(5)?),
                        channel_id: row.get(6)?,
                        source_file_name: row.get(7)?,
                        source_file_timestamp_us: row.get(8)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("read staging batch {batch_id}"))?;
        Ok(rows)
    }
}
