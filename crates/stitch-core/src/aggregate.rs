//! Materialized per-`SessionKey` event-kind aggregates.
//!
//! The cache is the incremental form of
//!
//! ```sql
//! SELECT session_start_us, session_id, ad_id,
//!        NEST(event_type)          AS all_events,
//!        NEST(DISTINCT event_type) AS distinct_events,
//!        COUNT(*)                  AS count
//! FROM events
//! GROUP BY session_start_us, session_id, ad_id
//! ```
//!
//! `all_events` lists event types in append (`event_id`) order with
//! duplicates; `distinct_events` is ascending and deduplicated. Groups are
//! extended inside the merge transaction that appends their rows, so a
//! reader never sees rows without their aggregate or the reverse.
//! [`AggregateCache::recompute`] is the direct aggregation the cache must
//! always equal.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::event::{EventKind, SessionKey};

/// Aggregated view of one session/ad group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionAggregate {
    #[serde(flatten)]
    pub key: SessionKey,
    pub all_events: Vec<EventKind>,
    pub distinct_events: Vec<EventKind>,
    pub count: i64,
}

impl SessionAggregate {
    fn empty(key: SessionKey) -> Self {
        Self {
            key,
            all_events: Vec::new(),
            distinct_events: Vec::new(),
            count: 0,
        }
    }

    /// Append event kinds in order, maintaining the distinct set and count.
    pub fn extend(&mut self, kinds: &[EventKind]) {
        self.all_events.extend_from_slice(kinds);
        let distinct: BTreeSet<EventKind> = self
            .distinct_events
            .iter()
            .chain(kinds.iter())
            .copied()
            .collect();
        self.distinct_events = distinct.into_iter().collect();
        self.count += i64::try_from(kinds.len()).unwrap_or(i64::MAX);
    }

    /// Whether `kind` occurred at least once in this group.
    #[must_use]
    pub fn contains(&self, kind: EventKind) -> bool {
        self.distinct_events.binary_search(&kind).is_ok()
    }

    /// Number of occurrences of `kind` in this group.
    #[must_use]
    pub fn occurrences(&self, kind: EventKind) -> usize {
        self.all_events.iter().filter(|&&k| k == kind).count()
    }
}

/// Event kinds appended to each group by one merge, in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateDelta {
    groups: BTreeMap<SessionKey, Vec<EventKind>>,
}

impl AggregateDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one appended row. Must be called in append order.
    pub fn record(&mut self, key: SessionKey, kind: EventKind) {
        self.groups.entry(key).or_default().push(kind);
    }

    /// Number of distinct groups touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// One cached group that disagrees with direct aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateMismatch {
    pub key: SessionKey,
    pub cached: Option<SessionAggregate>,
    pub recomputed: Option<SessionAggregate>,
}

/// Result of [`AggregateCache::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub groups_checked: usize,
    pub mismatches: Vec<AggregateMismatch>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Access to the `session_aggregates` materialized view.
pub struct AggregateCache<'conn> {
    conn: &'conn Connection,
}

impl<'conn> AggregateCache<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Extend every group in `delta`. Call inside the merge transaction.
    /// Returns the number of groups written.
    ///
    /// # Errors
    ///
    /// Returns an error if any read or write fails.
    pub fn apply(&self, delta: &AggregateDelta, now_us: i64) -> Result<usize> {
        for (key, kinds) in &delta.groups {
            let existing = self.get(key)?;
            let is_new = existing.is_none();
            let mut agg = existing.unwrap_or_else(|| SessionAggregate::empty(key.clone()));
            agg.extend(kinds);
            self.write(&agg, is_new, now_us)
                .with_context(|| format!("write aggregate {key}"))?;
        }
        Ok(delta.groups.len())
    }

    fn write(&self, agg: &SessionAggregate, is_new: bool, now_us: i64) -> Result<()> {
        let all = serde_json::to_string(&agg.all_events)?;
        let distinct = serde_json::to_string(&agg.distinct_events)?;
        if is_new {
            self.conn.execute(
                "INSERT INTO session_aggregates (
                    session_start_us, session_id, ad_id, all_events, distinct_events,
                    event_count, updated_at_us
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    agg.key.session_start_us,
                    agg.key.session_id,
                    agg.key.ad_id,
                    all,
                    distinct,
                    agg.count,
                    now_us
                ],
            )?;
        } else {
            self.conn.execute(
                "UPDATE session_aggregates
                 SET all_events = ?4, distinct_events = ?5, event_count = ?6, updated_at_us = ?7
                 WHERE session_start_us = ?1 AND session_id = ?2 AND ad_id IS ?3",
                params![
                    agg.key.session_start_us,
                    agg.key.session_id,
                    agg.key.ad_id,
                    all,
                    distinct,
                    agg.count,
                    now_us
                ],
            )?;
        }
        Ok(())
    }

    /// Cached aggregate for `key`, if the group exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or holds malformed JSON.
    pub fn get(&self, key: &SessionKey) -> Result<Option<SessionAggregate>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT session_start_us, session_id, ad_id, all_events, distinct_events, event_count
             FROM session_aggregates
             WHERE session_start_us = ?1 AND session_id = ?2 AND ad_id IS ?3",
        )?;
        let found = stmt
            .query_row(
                params![key.session_start_us, key.session_id, key.ad_id],
                read_cached_row,
            )
            .optional()
            .with_context(|| format!("read aggregate {key}"))?;
        found.map(CachedRow::decode).transpose()
    }

    /// Aggregate `key` directly from the event store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn recompute(&self, key: &SessionKey) -> Result<Option<SessionAggregate>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT event_type
             FROM events
             WHERE session_start_us = ?1 AND session_id = ?2 AND ad_id IS ?3
             ORDER BY event_id",
        )?;
        let kinds = stmt
            .query_map(
                params![key.session_start_us, key.session_id, key.ad_id],
                |row| Ok(EventKind(row.get(0)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("recompute aggregate {key}"))?;

        if kinds.is_empty() {
            return Ok(None);
        }
        let mut agg = SessionAggregate::empty(key.clone());
        agg.extend(&kinds);
        Ok(Some(agg))
    }

    /// Aggregate every group directly from the event store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn recompute_all(&self) -> Result<BTreeMap<SessionKey, SessionAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_start_us, session_id, ad_id, event_type
             FROM events
             ORDER BY event_id",
        )?;
        let mut groups: BTreeMap<SessionKey, SessionAggregate> = BTreeMap::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key = SessionKey {
                session_start_us: row.get(0)?,
                session_id: row.get(1)?,
                ad_id: row.get(2)?,
            };
            let kind = EventKind(row.get(3)?);
            groups
                .entry(key.clone())
                .or_insert_with(|| SessionAggregate::empty(key))
                .extend(&[kind]);
        }
        Ok(groups)
    }

    /// Every cached group, keyed by session key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn all(&self) -> Result<BTreeMap<SessionKey, SessionAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_start_us, session_id, ad_id, all_events, distinct_events, event_count
             FROM session_aggregates",
        )?;
        let cached = stmt
            .query_map([], read_cached_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read aggregate cache")?;
        cached
            .into_iter()
            .map(|row| row.decode().map(|agg| (agg.key.clone(), agg)))
            .collect()
    }

    /// Compare every cached group with direct aggregation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn verify(&self) -> Result<VerifyReport> {
        let cached = self.all()?;
        let recomputed = self.recompute_all()?;

        let keys: BTreeSet<&SessionKey> = cached.keys().chain(recomputed.keys()).collect();
        let mut report = VerifyReport {
            groups_checked: keys.len(),
            mismatches: Vec::new(),
        };
        for key in keys {
            let lhs = cached.get(key);
            let rhs = recomputed.get(key);
            if lhs != rhs {
                report.mismatches.push(AggregateMismatch {
                    key: key.clone(),
                    cached: lhs.cloned(),
                    recomputed: rhs.cloned(),
                });
            }
        }

        if report.is_consistent() {
            tracing::info!(groups = report.groups_checked, "aggregate cache consistent");
        } else {
            tracing::warn!(
                groups = report.groups_checked,
                mismatches = report.mismatches.len(),
                "aggregate cache drifted from event store"
            );
        }
        Ok(report)
    }

    /// Replace the whole cache with direct aggregation. Returns groups written.
    ///
    /// Runs in its own transaction; the caller must not hold one open.
    ///
    /// # Errors
    ///
    /// Returns an error if any read or write fails; the cache is unchanged
    /// in that case.
    pub fn rebuild(conn: &mut Connection, now_us: i64) -> Result<usize> {
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("begin aggregate rebuild")?;
        let written = {
            let cache = AggregateCache::new(&tx);
            let groups = cache.recompute_all()?;
            tx.execute("DELETE FROM session_aggregates", [])
                .context("clear aggregate cache")?;
            for agg in groups.values() {
                cache.write(agg, true, now_us)?;
            }
            groups.len()
        };
        tx.commit().context("commit aggregate rebuild")?;
        tracing::info!(groups = written, "aggregate cache rebuilt");
        Ok(written)
    }
}

struct CachedRow {
    key: SessionKey,
    all_events: String,
    distinct_events: String,
    count: i64,
}

impl CachedRow {
    fn decode(self) -> Result<SessionAggregate> {
        let all_events: Vec<EventKind> = serde_json::from_str(&self.all_events)
            .with_context(|| format!("decode all_events for {}", self.key))?;
        let distinct_events: Vec<EventKind> = serde_json::from_str(&self.distinct_events)
            .with_context(|| format!("decode distinct_events for {}", self.key))?;
        Ok(SessionAggregate {
            key: self.key,
            all_events,
            distinct_events,
            count: self.count,
        })
    }
}

fn read_cached_row(row: &Row<'_>) -> rusqlite::Result<CachedRow> {
    Ok(CachedRow {
        key: SessionKey {
            session_start_us: row.get(0)?,
            session_id: row.get(1)?,
            ad_id: row.get(2)?,
        },
        all_events: row.get(3)?,
        distinct_events: row.get(4)?,
        count: row.get(5)?,
    })
}
