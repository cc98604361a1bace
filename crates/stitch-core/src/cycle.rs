//! One batch cycle: list, filter, stage, merge.
//!
//! ```text
//! list_files ─▶ FileLedger::filter_new ─▶ read_file* ─▶ stage (txn 1)
//!                                                          │
//!   ┌──────────────────── BEGIN IMMEDIATE (txn 2) ─────────┘
//!   │ reconcile ─▶ merge ─▶ aggregate apply ─▶ batch_log ─▶ reset
//!   └──────────────────── COMMIT
//! ```
//!
//! Source failures surface before anything is written. A failure inside
//! txn 2 rolls back every append and aggregate change and leaves the staged
//! rows in place; the next cycle stages the same files again under the same
//! batch id.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use rusqlite::{Connection, TransactionBehavior, params};
use serde::{Serialize, Serializer};

use crate::aggregate::AggregateCache;
use crate::db::{self, now_us};
use crate::enrich::{EnrichmentResolver, ReferenceData};
use crate::error::ErrorCode;
use crate::event::RawEvent;
use crate::ledger::FileLedger;
use crate::lock::{IngestLock, LockError, lock_path_for};
use crate::session::SessionIndex;
use crate::source::{SourceConnector, SourceError, SourceFile};
use crate::staging::{StagingBuffer, batch_id_for};
use crate::store::EventStore;

/// Errors that abort a batch cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// The merge transaction failed and was rolled back.
    #[error("merge of batch {batch_id} rolled back: {source:#}")]
    Merge {
        batch_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CycleError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Source(err) => err.code(),
            Self::Lock(err) => err.code(),
            Self::Merge { .. } => ErrorCode::MergeFailed,
            Self::Store(_) => ErrorCode::StoreUnavailable,
        }
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Empty when the cycle found no new rows.
    pub batch_id: String,
    pub files_seen: usize,
    /// New files that contributed at least one row.
    pub files_new: usize,
    /// New files that held no rows. They stay uncommitted and are listed
    /// again by later cycles.
    pub files_empty: usize,
    pub rows_staged: usize,
    pub rows_appended: usize,
    pub rows_skipped: usize,
    pub enrichment_misses: usize,
    pub sessions_reconciled: usize,
    pub groups_touched: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl CycleReport {
    /// Whether the cycle found no rows to ingest.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.files_new == 0
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_millis<S: Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// New files of one cycle and their rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedBatch {
    /// Empty when no new file holds rows.
    pub batch_id: String,
    pub files_seen: usize,
    /// New files with at least one row.
    pub files: Vec<SourceFile>,
    pub files_empty: usize,
    pub rows: Vec<RawEvent>,
}

impl LoadedBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// List the source, keep files the ledger has not seen, and read them.
///
/// New files without rows are counted but left out of the batch, so a
/// listing that only adds empty files loads as empty. Writes nothing.
///
/// # Errors
///
/// Returns [`CycleError::Source`] if listing or reading fails and
/// [`CycleError::Store`] if the ledger cannot be queried.
pub fn load_batch(
    conn: &Connection,
    source: &dyn SourceConnector,
) -> Result<LoadedBatch, CycleError> {
    let listing = source.list_files()?;
    let files_seen = listing.len();
    let files = FileLedger::new(conn).filter_new(listing)?;
    if files.is_empty() {
        tracing::debug!(files_seen, "no new source files");
        return Ok(LoadedBatch {
            files_seen,
            ..LoadedBatch::default()
        });
    }

    let mut rows = Vec::new();
    let mut contributing = Vec::with_capacity(files.len());
    let mut files_empty = 0;
    for file in files {
        let file_rows = source.read_file(&file)?;
        tracing::debug!(file = %file.name, rows = file_rows.len(), "read source file");
        if file_rows.is_empty() {
            files_empty += 1;
            continue;
        }
        rows.extend(file_rows);
        contributing.push(file);
    }

    if contributing.is_empty() {
        tracing::debug!(files_seen, files_empty, "new source files hold no rows");
        return Ok(LoadedBatch {
            files_seen,
            files_empty,
            ..LoadedBatch::default()
        });
    }

    Ok(LoadedBatch {
        batch_id: batch_id_for(&contributing),
        files_seen,
        files: contributing,
        files_empty,
        rows,
    })
}

/// Run one batch cycle against `conn`.
///
/// The caller must ensure no other cycle runs against the same store;
/// [`Pipeline`] does so with the ingest lock.
///
/// # Errors
///
/// See [`CycleError`]. On any error the store holds exactly what it held
/// before the merge transaction began.
pub fn run_cycle(
    conn: &mut Connection,
    source: &dyn SourceConnector,
    resolver: &dyn EnrichmentResolver,
) -> Result<CycleReport, CycleError> {
    let started = Instant::now();

    let batch = load_batch(conn, source)?;
    if batch.is_empty() {
        return Ok(CycleReport {
            files_seen: batch.files_seen,
            files_empty: batch.files_empty,
            elapsed: started.elapsed(),
            ..CycleReport::default()
        });
    }

    let rows_staged = stage_batch(conn, &batch)?;

    let mut report = merge_batch(conn, &batch.batch_id, resolver).map_err(|source| {
        tracing::error!(batch_id = %batch.batch_id, error = %format!("{source:#}"), "merge rolled back");
        CycleError::Merge {
            batch_id: batch.batch_id.clone(),
            source,
        }
    })?;

    report.batch_id = batch.batch_id;
    report.files_seen = batch.files_seen;
    report.files_new = batch.files.len();
    report.files_empty = batch.files_empty;
    report.rows_staged = rows_staged;
    report.elapsed = started.elapsed();

    tracing::info!(
        batch_id = %report.batch_id,
        files = report.files_new,
        rows = report.rows_appended,
        groups = report.groups_touched,
        elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        "batch committed"
    );
    Ok(report)
}

fn stage_batch(conn: &mut Connection, batch: &LoadedBatch) -> Result<usize, CycleError> {
    let tx = conn.transaction().context("begin staging transaction")?;
    let staging = StagingBuffer::new(&tx);
    staging.purge_other_batches(&batch.batch_id)?;
    let staged = staging.stage(&batch.batch_id, &batch.rows)?;
    tx.commit().context("commit staging transaction")?;
    tracing::debug!(batch_id = %batch.batch_id, rows = staged, "batch staged");
    Ok(staged)
}

fn merge_batch(
    conn: &mut Connection,
    batch_id: &str,
    resolver: &dyn EnrichmentResolver,
) -> anyhow::Result<CycleReport> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin merge transaction")?;

    let starts = SessionIndex::new(&tx).reconcile(batch_id)?;
    let outcome = EventStore::new(&tx).merge(batch_id, &starts, resolver)?;
    let committed_at = now_us();
    let groups_touched = AggregateCache::new(&tx).apply(&outcome.delta, committed_at)?;

    let file_count: i64 = tx.query_row(
        "SELECT COUNT(DISTINCT source_file_name) FROM events WHERE batch_id = ?1",
        params![batch_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO batch_log (batch_id, file_count, row_count, committed_at_us)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            batch_id,
            file_count,
            i64::try_from(outcome.appended).unwrap_or(i64::MAX),
            committed_at
        ],
    )
    .context("record batch")?;

    StagingBuffer::new(&tx).reset(batch_id)?;
    tx.commit().context("commit merge transaction")?;

    Ok(CycleReport {
        rows_appended: outcome.appended,
        rows_skipped: outcome.skipped_committed,
        enrichment_misses: outcome.enrichment_misses,
        sessions_reconciled: starts.len(),
        groups_touched,
        ..CycleReport::default()
    })
}

/// A store connection plus the ingest lock discipline around each cycle.
pub struct Pipeline {
    conn: Connection,
    store_path: PathBuf,
    lock_timeout: Duration,
}

impl Pipeline {
    /// Open (and migrate) the store at `store_path`.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::Store`] if the store cannot be opened.
    pub fn open(store_path: &Path, lock_timeout: Duration) -> Result<Self, CycleError> {
        let conn = db::open_store(store_path)?;
        Ok(Self {
            conn,
            store_path: store_path.to_path_buf(),
            lock_timeout,
        })
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Run one cycle while holding the ingest lock.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::Lock`] if another cycle holds the lock past
    /// the configured timeout, otherwise as [`run_cycle`].
    pub fn run(
        &mut self,
        source: &dyn SourceConnector,
        resolver: &dyn EnrichmentResolver,
    ) -> Result<CycleReport, CycleError> {
        let _lock = IngestLock::acquire(&lock_path_for(&self.store_path), self.lock_timeout)?;
        run_cycle(&mut self.conn, source, resolver)
    }

    /// Run one cycle enriching from the store's own reference tables,
    /// snapshotted under the lock before the cycle starts.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::run`], plus [`CycleError::Store`] if the reference
    /// tables cannot be read.
    pub fn run_with_stored_reference(
        &mut self,
        source: &dyn SourceConnector,
    ) -> Result<CycleReport, CycleError> {
        let _lock = IngestLock::acquire(&lock_path_for(&self.store_path), self.lock_timeout)?;
        let reference = ReferenceData::load_from_store(&self.conn)?;
        tracing::debug!(entries = reference.len(), "reference snapshot loaded");
        run_cycle(&mut self.conn, source, &reference)
    }
}
