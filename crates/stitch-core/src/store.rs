//! Append-only store of enriched events.
//!
//! [`EventStore::merge`] turns one staged batch into committed rows. It
//! never opens a transaction of its own: [`crate::cycle`] runs it inside the
//! same `IMMEDIATE` transaction as the aggregate update and the staging
//! reset, which is what makes the three all-or-nothing.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, Row, params};
use serde::Serialize;

use crate::aggregate::AggregateDelta;
use crate::enrich::{EnrichmentResolver, enrich};
use crate::event::{EnrichedEvent, EventKind, RawEvent, SessionKey};
use crate::ledger::FileLedger;
use crate::staging::StagingBuffer;

/// What one merge appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Rows appended to `events`.
    pub appended: usize,
    /// Staged rows dropped because their file was committed meanwhile.
    pub skipped_committed: usize,
    /// Rows whose ad or channel had no reference entry.
    pub enrichment_misses: usize,
    /// Per-group event kinds appended, in append order.
    #[serde(skip)]
    pub delta: AggregateDelta,
}

/// Access to the `events` fact table.
pub struct EventStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> EventStore<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Append every row staged under `batch_id`, with its session start
    /// taken from `session_starts` and enrichment from `resolver`.
    ///
    /// Files that already have committed rows are re-checked here, under
    /// the caller's write transaction, and their staged rows are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a staged session has no reconciled start, if the
    /// resolver backend fails, or if any insert fails. The caller must roll
    /// back in that case.
    pub fn merge(
        &self,
        batch_id: &str,
        session_starts: &HashMap<String, i64>,
        resolver: &dyn EnrichmentResolver,
    ) -> Result<MergeOutcome> {
        let staged = StagingBuffer::new(self.conn).rows(batch_id)?;
        let ledger = FileLedger::new(self.conn);

        let mut outcome = MergeOutcome::default();
        // Decided once per file, before any of its rows is appended.
        let mut committed_files: HashMap<String, bool> = HashMap::new();

        let mut insert = self.conn.prepare_cached(
            "INSERT INTO events (
                event_time_us, ad_id, session_id, viewer_id, event_type, channel_id,
                source_file_name, source_file_timestamp_us, session_start_us,
                campaign_id, advertiser_id, content_distributor_id, batch_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;

        for row in staged {
            let raw = row.raw;

            let file = raw.source_file_name.clone();
            let already = if let Some(&known) = committed_files.get(&file) {
                known
            } else {
                let known = !ledger.is_new(&file)?;
                committed_files.insert(file.clone(), known);
                known
            };
            if already {
                outcome.skipped_committed += 1;
                continue;
            }

            let session_start_us = *session_starts.get(&raw.session_id).with_context(|| {
                format!("no reconciled session start for session {}", raw.session_id)
            })?;
            let enrichment = enrich(resolver, &raw)
                .with_context(|| format!("enrich row of session {}", raw.session_id))?;
            if (raw.ad_id.is_some() && enrichment.campaign_id.is_none())
                || enrichment.content_distributor_id.is_none()
            {
                outcome.enrichment_misses += 1;
            }

            insert
                .execute(params![
                    raw.event_time_us,
                    raw.ad_id,
                    raw.session_id,
                    raw.viewer_id,
                    raw.event_type.code(),
                    raw.channel_id,
                    raw.source_file_name,
                    raw.source_file_timestamp_us,
                    session_start_us,
                    enrichment.campaign_id,
                    enrichment.advertiser_id,
                    enrichment.content_distributor_id,
                    batch_id,
                ])
                .with_context(|| format!("append event from {file}"))?;

            outcome.delta.record(
                SessionKey {
                    session_start_us,
                    session_id: raw.session_id,
                    ad_id: raw.ad_id,
                },
                raw.event_type,
            );
            outcome.appended += 1;
        }

        if outcome.skipped_committed > 0 {
            tracing::warn!(
                batch_id,
                skipped = outcome.skipped_committed,
                "dropped staged rows of files committed by another cycle"
            );
        }
        Ok(outcome)
    }

    /// Committed rows with `from_us <= session_start_us < to_us`, ordered by
    /// session start, then ad, then append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn scan_range(&self, from_us: i64, to_us: i64) -> Result<Vec<EnrichedEvent>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             WHERE session_start_us >= ?1 AND session_start_us < ?2
             ORDER BY session_start_us, ad_id, event_id"
        ))?;
        let rows = stmt
            .query_map(params![from_us, to_us], read_event)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("scan events by session start")?;
        Ok(rows)
    }

    /// Committed rows of one session across all its start groups, in
    /// append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn session_events(&self, session_id: &str) -> Result<Vec<EnrichedEvent>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             WHERE session_id = ?1
             ORDER BY event_id"
        ))?;
        let rows = stmt
            .query_map(params![session_id], read_event)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("read events of session {session_id}"))?;
        Ok(rows)
    }

    /// Total committed rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .context("count events")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

const EVENT_COLUMNS: &str = "event_id, event_time_us, ad_id, session_id, viewer_id, event_type, \
     channel_id, source_file_name, source_file_timestamp_us, session_start_us, campaign_id, \
     advertiser_id, content_distributor_id";

fn read_event(row: &Row<'_>) -> rusqlite::Result<EnrichedEvent> {
    Ok(EnrichedEvent {
        event_id: row.get(0)?,
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
        session_start_us: row.get(9)?,
        campaign_id: row.get(10)?,
        advertiser_id: row.get(11)?,
        content_distributor_id: row.get(12)?,
    })
}
