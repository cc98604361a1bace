//! Cross-batch session-start reconciliation.
//!
//! A session's start is the earliest event time known for its id at the
//! moment rows are appended. Committed rows keep whatever start they were
//! given, so a session that later turns out to have begun earlier spans
//! several `session_start_us` groups. The committed minimum is therefore
//! taken over raw `event_time_us` across all of the session's rows, never
//! from the latest group's start.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;

/// One `session_start_us` group of a session, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionGroup {
    pub session_start_us: i64,
    pub row_count: i64,
    pub min_event_time_us: i64,
    pub max_event_time_us: i64,
}

/// Resolves session starts for the sessions of a staged batch.
pub struct SessionIndex<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SessionIndex<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Map every session id staged under `batch_id` to its session start:
    /// `min(staged_min, committed_min)`, or `staged_min` for a new session.
    ///
    /// Sessions without staged rows are not touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn reconcile(&self, batch_id: &str) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT s.session_id,
                    MIN(s.event_time_us),
                    (SELECT MIN(e.event_time_us)
                       FROM events e
                      WHERE e.session_id = s.session_id)
             FROM staged_events s
             WHERE s.batch_id = ?1
             GROUP BY s.session_id",
        )?;

        let mut starts = HashMap::new();
        let mut rows = stmt.query(params![batch_id])?;
        while let Some(row) = rows.next()? {
            let session_id: String = row.get(0)?;
            let staged_min: i64 = row.get(1)?;
            let committed_min: Option<i64> = row.get(2)?;

            let start = committed_min.map_or(staged_min, |committed| committed.min(staged_min));
            if committed_min.is_some_and(|committed| staged_min < committed) {
                tracing::debug!(
                    session_id = %session_id,
                    staged_min,
                    committed_min,
                    "batch reveals an earlier session start; committed rows keep the old start"
                );
            }
            starts.insert(session_id, start);
        }
        Ok(starts)
    }

    /// Every session-start group stored for `session_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub fn session_groups(&self, session_id: &str) -> Result<Vec<SessionGroup>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT session_start_us, COUNT(*), MIN(event_time_us), MAX(event_time_us)
             FROM events
             WHERE session_id = ?1
             GROUP BY session_start_us
             ORDER BY session_start_us",
        )?;
        let groups = stmt
            .query_map(params![session_id], |row| {
                Ok(SessionGroup {
                    session_start_us: row.get(0)?,
                    row_count: row.get(1)?,
                    min_event_time_us: row.get(2)?,
                    max_event_time_us: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("list session groups for {session_id}"))?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionIndex;
    use crate::db::open_in_memory;
    use crate::event::{EventKind, RawEvent};
    use crate::staging::StagingBuffer;
    use rusqlite::{Connection, params};

    fn raw(session: &str, t: i64) -> RawEvent {
        RawEvent {
            event_time_us: t,
            ad_id: None,
            session_id: session.into(),
            viewer_id: "v".into(),
            event_type: EventKind::REQUEST,
            channel_id: 1,
            source_file_name: "f".into(),
            source_file_timestamp_us: 0,
        }
    }

    fn commit(conn: &Connection, session: &str, t: i64, start: i64) {
        conn.execute(
            "INSERT INTO events (
                event_time_us, ad_id, session_id, viewer_id, event_type, channel_id,
                source_file_name, source_file_timestamp_us, session_start_us, batch_id
            ) VALUES (?1, NULL, ?2, 'v', 1, 1, 'old', 0, ?3, 'b0')",
            params![t, session, start],
        )
        .expect("insert committed row");
    }

    #[test]
    fn new_session_uses_staged_minimum() {
        let conn = open_in_memory().expect("store");
        StagingBuffer::new(&conn)
            .stage("b1", &[raw("S1", 30), raw("S1", 10)])
            .expect("stage");

        let starts = SessionIndex::new(&conn).reconcile("b1").expect("reconcile");
        assert_eq!(starts.get("S1"), Some(&10));
    }

    #[test]
    fn committed_earlier_event_wins() {
        let conn = open_in_memory().expect("store");
        commit(&conn, "S1", 5, 5);
        StagingBuffer::new(&conn)
            .stage("b1", &[raw("S1", 30)])
            .expect("stage");

        let starts = SessionIndex::new(&conn).reconcile("b1").expect("reconcile");
        assert_eq!(starts.get("S1"), Some(&5));
    }

    #[test]
    fn committed_minimum_spans_all_start_groups() {
        let conn = open_in_memory().expect("store");
        // Rows under start 20 were committed before event 8 arrived.
        commit(&conn, "S1", 20, 20);
        commit(&conn, "S1", 8, 8);
        commit(&conn, "S1", 25, 20);
        StagingBuffer::new(&conn)
            .stage("b1", &[raw("S1", 40)])
            .expect("stage");

        let starts = SessionIndex::new(&conn).reconcile("b1").expect("reconcile");
        assert_eq!(starts.get("S1"), Some(&8));
    }

    #[test]
    fn unstaged_sessions_are_left_out() {
        let conn = open_in_memory().expect("store");
        commit(&conn, "S9", 1, 1);
        StagingBuffer::new(&conn)
            .stage("b1", &[raw("S1", 3)])
            .expect("stage");

        let starts = SessionIndex::new(&conn).reconcile("b1").expect("reconcile");
        assert_eq!(starts.len(), 1);
        assert!(!starts.contains_key("S9"));
    }

    #[test]
    fn session_groups_lists_stale_and_current_starts() {
        let conn = open_in_memory().expect("store");
        commit(&conn, "S1", 20, 20);
        commit(&conn, "S1", 22, 20);
        commit(&conn, "S1", 8, 8);

        let groups = SessionIndex::new(&conn).session_groups("S1").expect("groups");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].session_start_us, 8);
        assert_eq!(groups[1].session_start_us, 20);
        assert_eq!(groups[1].row_count, 2);
        assert_eq!(groups[1].max_event_time_us, 22);
    }
}
