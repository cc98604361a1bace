//! Click-without-completion fraud pattern over the aggregate cache.
//!
//! A group is flagged when its `session_start_us` falls inside the trailing
//! window (`>= now - window`, inclusive), its distinct event kinds contain
//! the click code, and they do not contain the terminal (completion) code.
//! Every click occurrence in the group counts towards
//! `fraudulent_click_count`; the count is not capped.
//!
//! [`FraudEvaluator::detect`] returns a [`FraudScan`], a lazy iterator that
//! pulls flagged groups page by page in session-start order. The scan runs
//! in a read transaction so every page comes from the same snapshot.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rusqlite::{Connection, Transaction, params};
use serde::Serialize;

use crate::error::ErrorCode;
use crate::event::{EventKind, MICROS_PER_DAY, SessionKey};

/// Default number of groups fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Errors yielded by a fraud scan.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// The caller-supplied timeout elapsed before the scan finished.
    #[error("fraud scan timed out after {elapsed:?} ({emitted} flags emitted)")]
    Timeout { elapsed: Duration, emitted: usize },

    /// The store could not be read.
    #[error("fraud scan store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A cached aggregate holds malformed JSON.
    #[error("fraud scan could not decode aggregate: {0}")]
    Decode(#[from] serde_json::Error),
}

impl DetectError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::DetectTimeout,
            Self::Store(_) => ErrorCode::StoreUnavailable,
            Self::Decode(_) => ErrorCode::CorruptStore,
        }
    }
}

/// Parameters of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectParams {
    /// Evaluation instant, epoch microseconds.
    pub now_us: i64,
    /// Trailing window length in microseconds.
    pub window_us: i64,
    pub click: EventKind,
    pub terminal: EventKind,
    pub timeout: Option<Duration>,
    pub page_size: usize,
}

impl DetectParams {
    /// Defaults at `now_us`: one-day window, click = 2, terminal = 9.
    #[must_use]
    pub const fn at(now_us: i64) -> Self {
        Self {
            now_us,
            window_us: MICROS_PER_DAY,
            click: EventKind::CLICK,
            terminal: EventKind::COMPLETION,
            timeout: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_us = i64::try_from(window.as_micros()).unwrap_or(i64::MAX);
        self
    }

    #[must_use]
    pub const fn with_codes(mut self, click: EventKind, terminal: EventKind) -> Self {
        self.click = click;
        self.terminal = terminal;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Earliest session start inside the window.
    #[must_use]
    pub const fn cutoff_us(&self) -> i64 {
        self.now_us.saturating_sub(self.window_us)
    }
}

/// One flagged session/ad group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FraudFlag {
    pub session_start_us: i64,
    pub session_id: String,
    pub ad_id: Option<i64>,
    pub fraudulent_click_count: usize,
    pub count: i64,
    pub all_events: Vec<EventKind>,
    pub distinct_events: Vec<EventKind>,
}

impl FraudFlag {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey {
            session_start_us: self.session_start_us,
            session_id: self.session_id.clone(),
            ad_id: self.ad_id,
        }
    }
}

/// Evaluates the fraud pattern against `session_aggregates`.
pub struct FraudEvaluator<'conn> {
    conn: &'conn Connection,
}

impl<'conn> FraudEvaluator<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Start a fresh scan. Nothing is read until the iterator is polled.
    ///
    /// If the connection is not already inside a transaction, the scan
    /// opens a read transaction that lives as long as the iterator.
    ///
    /// # Errors
    ///
    /// Returns an error if the read transaction cannot be started.
    pub fn detect(&self, params: DetectParams) -> Result<FraudScan<'conn>, DetectError> {
        let snapshot = if self.conn.is_autocommit() {
            Some(self.conn.unchecked_transaction()?)
        } else {
            None
        };
        let cutoff = params.cutoff_us();
        tracing::debug!(
            now_us = params.now_us,
            cutoff_us = cutoff,
            click = params.click.code(),
            terminal = params.terminal.code(),
            "starting fraud scan"
        );
        Ok(FraudScan {
            conn: self.conn,
            _snapshot: snapshot,
            cursor: (cutoff, 0),
            page: VecDeque::new(),
            exhausted: false,
            finished: false,
            started: Instant::now(),
            emitted: 0,
            params,
        })
    }
}

/// Lazy, single-pass sequence of [`FraudFlag`]s.
///
/// After a `Timeout` or store error item the iterator is finished.
pub struct FraudScan<'conn> {
    conn: &'conn Connection,
    _snapshot: Option<Transaction<'conn>>,
    params: DetectParams,
    /// `(session_start_us, agg_id)` of the last fetched row.
    cursor: (i64, i64),
    page: VecDeque<FraudFlag>,
    exhausted: bool,
    finished: bool,
    started: Instant,
    emitted: usize,
}

impl FraudScan<'_> {
    fn fetch_page(&mut self) -> Result<(), DetectError> {
        let limit = i64::try_from(self.params.page_size.max(1)).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(
            "SELECT agg_id, session_start_us, session_id, ad_id, all_events, distinct_events,
                    event_count
             FROM session_aggregates
             WHERE (session_start_us, agg_id) > (?1, ?2)
               AND EXISTS (SELECT 1 FROM json_each(distinct_events) WHERE value = ?3)
               AND NOT EXISTS (SELECT 1 FROM json_each(distinct_events) WHERE value = ?4)
             ORDER BY session_start_us, agg_id
             LIMIT ?5",
        )?;
        let mut rows = stmt.query(params![
            self.cursor.0,
            self.cursor.1,
            self.params.click.code(),
            self.params.terminal.code(),
            limit
        ])?;

        let mut fetched = 0_i64;
        while let Some(row) = rows.next()? {
            fetched += 1;
            let agg_id: i64 = row.get(0)?;
            let session_start_us: i64 = row.get(1)?;
            let all_events: Vec<EventKind> = serde_json::from_str(&row.get::<_, String>(4)?)?;
            let distinct_events: Vec<EventKind> =
                serde_json::from_str(&row.get::<_, String>(5)?)?;
            let fraudulent_click_count = all_events
                .iter()
                .filter(|&&kind| kind == self.params.click)
                .count();

            self.page.push_back(FraudFlag {
                session_start_us,
                session_id: row.get(2)?,
                ad_id: row.get(3)?,
                fraudulent_click_count,
                count: row.get(6)?,
                all_events,
                distinct_events,
            });
            self.cursor = (session_start_us, agg_id);
        }

        if fetched < limit {
            self.exhausted = true;
        }
        Ok(())
    }

    fn fail(&mut self, err: DetectError) -> Option<Result<FraudFlag, DetectError>> {
        self.finished = true;
        self.page.clear();
        Some(Err(err))
    }
}

impl Iterator for FraudScan<'_> {
    type Item = Result<FraudFlag, DetectError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(flag) = self.page.pop_front() {
                self.emitted += 1;
                return Some(Ok(flag));
            }
            if self.exhausted {
                self.finished = true;
                tracing::debug!(flags = self.emitted, "fraud scan finished");
                return None;
            }
            if let Some(timeout) = self.params.timeout {
                let elapsed = self.started.elapsed();
                if elapsed >= timeout {
                    tracing::warn!(?elapsed, emitted = self.emitted, "fraud scan timed out");
                    let emitted = self.emitted;
                    return self.fail(DetectError::Timeout { elapsed, emitted });
                }
            }
            if let Err(err) = self.fetch_page() {
                return self.fail(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateCache, AggregateDelta};
    use crate::db::open_in_memory;

    fn seed(conn: &Connection, start: i64, session: &str, ad: Option<i64>, kinds: &[i64]) {
        let mut delta = AggregateDelta::new();
        for &k in kinds {
            delta.record(
                SessionKey {
                    session_start_us: start,
                    session_id: session.into(),
                    ad_id: ad,
                },
                EventKind(k),
            );
        }
        AggregateCache::new(conn).apply(&delta, 0).expect("seed aggregate");
    }

    fn flags(conn: &Connection, params: DetectParams) -> Vec<FraudFlag> {
        FraudEvaluator::new(conn)
            .detect(params)
            .expect("start scan")
            .collect::<Result<Vec<_>, _>>()
            .expect("scan")
    }

    #[test]
    fn click_without_completion_is_flagged() {
        let conn = open_in_memory().expect("store");
        seed(&conn, 10, "S1", Some(5), &[1, 2]);
        seed(&conn, 10, "S2", Some(5), &[1, 2, 9]);
        seed(&conn, 10, "S3", Some(5), &[1]);

        let found = flags(&conn, DetectParams::at(13));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, "S1");
        assert_eq!(found[0].fraudulent_click_count, 1);
        assert_eq!(found[0].count, 2);
    }

    #[test]
    fn repeated_clicks_are_all_counted() {
        let conn = open_in_memory().expect("store");
        seed(&conn, 10, "S1", None, &[2, 1, 2, 2]);

        let found = flags(&conn, DetectParams::at(13));
        assert_eq!(found[0].fraudulent_click_count, 3);
        assert_eq!(found[0].ad_id, None);
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let conn = open_in_memory().expect("store");
        let now = 10 * MICROS_PER_DAY;
        let cutoff = now - MICROS_PER_DAY;
        seed(&conn, cutoff, "on-edge", Some(1), &[2]);
        seed(&conn, cutoff - 1, "just-out", Some(1), &[2]);

        let found = flags(&conn, DetectParams::at(now));
        let ids: Vec<_> = found.iter().map(|f| f.session_id.as_str()).collect();
        assert_eq!(ids, ["on-edge"]);
    }

    #[test]
    fn custom_codes_and_window() {
        let conn = open_in_memory().expect("store");
        seed(&conn, 100, "S1", Some(1), &[7]);
        seed(&conn, 100, "S2", Some(1), &[7, 8]);

        let params = DetectParams::at(150)
            .with_window(Duration::from_micros(50))
            .with_codes(EventKind(7), EventKind(8));
        let found = flags(&conn, params);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, "S1");
    }

    #[test]
    fn pages_cover_every_group_in_start_order() {
        let conn = open_in_memory().expect("store");
        for i in 0..7 {
            seed(&conn, 100 - i, &format!("S{i}"), Some(1), &[2]);
        }
        seed(&conn, 95, "same-start", Some(2), &[2]);

        let found = flags(&conn, DetectParams::at(200).with_page_size(2));
        assert_eq!(found.len(), 8);
        let starts: Vec<_> = found.iter().map(|f| f.session_start_us).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn zero_timeout_yields_timeout_then_ends() {
        let conn = open_in_memory().expect("store");
        seed(&conn, 10, "S1", Some(5), &[2]);

        let mut scan = FraudEvaluator::new(&conn)
            .detect(DetectParams::at(13).with_timeout(Some(Duration::ZERO)))
            .expect("start scan");
        let first = scan.next().expect("one item");
        let err = first.expect_err("timeout");
        assert_eq!(err.code(), ErrorCode::DetectTimeout);
        assert!(scan.next().is_none());
    }

    #[test]
    fn each_detect_call_is_a_fresh_scan() {
        let conn = open_in_memory().expect("store");
        seed(&conn, 10, "S1", Some(5), &[2]);
        let evaluator = FraudEvaluator::new(&conn);

        let first: Vec<_> = evaluator.detect(DetectParams::at(13)).expect("scan").collect();
        let second: Vec<_> = evaluator.detect(DetectParams::at(13)).expect("scan").collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
