//! Canonical SQLite schema for the stitch store.
//!
//! - `events` is the append-only fact table of enriched events
//! - `staged_events` holds one batch of raw rows between staging and merge
//! - `session_aggregates` is the materialized per-`SessionKey` event-kind view
//! - `batch_log` records every committed batch cycle
//! - `ref_*` tables hold enrichment reference data (migration v2)
//! - `store_meta` tracks the schema version

/// Migration v1: fact, staging, aggregate, and bookkeeping tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_time_us INTEGER NOT NULL,
    ad_id INTEGER,
    session_id TEXT NOT NULL,
    viewer_id TEXT NOT NULL,
    event_type INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    source_file_name TEXT NOT NULL,
    source_file_timestamp_us INTEGER NOT NULL,
    session_start_us INTEGER NOT NULL,
    campaign_id INTEGER,
    advertiser_id INTEGER,
    content_distributor_id INTEGER,
    batch_id TEXT NOT NULL,
    CHECK (session_start_us <= event_time_us)
);

CREATE INDEX IF NOT EXISTS idx_events_start_ad
    ON events(session_start_us, ad_id);

CREATE INDEX IF NOT EXISTS idx_events_session_time
    ON events(session_id, event_time_us);

CREATE INDEX IF NOT EXISTS idx_events_source_file
    ON events(source_file_name);

CREATE TABLE IF NOT EXISTS staged_events (
    staged_id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    event_time_us INTEGER NOT NULL,
    ad_id INTEGER,
    session_id TEXT NOT NULL,
    viewer_id TEXT NOT NULL,
    event_type INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    source_file_name TEXT NOT NULL,
    source_file_timestamp_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staged_events_batch_session
    ON staged_events(batch_id, session_id, event_time_us);

CREATE TABLE IF NOT EXISTS session_aggregates (
    agg_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_start_us INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    ad_id INTEGER,
    all_events TEXT NOT NULL,
    distinct_events TEXT NOT NULL,
    event_count INTEGER NOT NULL CHECK (event_count > 0),
    updated_at_us INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_session_aggregates_key
    ON session_aggregates(session_start_us, session_id, ifnull(ad_id, 'none'));

CREATE INDEX IF NOT EXISTS idx_session_aggregates_start
    ON session_aggregates(session_start_us, agg_id);

CREATE TABLE IF NOT EXISTS batch_log (
    batch_id TEXT PRIMARY KEY,
    file_count INTEGER NOT NULL,
    row_count INTEGER NOT NULL,
    committed_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, created_at_us)
VALUES (1, 1, CAST((julianday('now') - 2440587.5) * 86400000000 AS INTEGER));
";

/// Migration v2: enrichment reference tables.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ref_ads (
    ad_id INTEGER PRIMARY KEY,
    campaign_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ref_campaigns (
    campaign_id INTEGER PRIMARY KEY,
    advertiser_id INTEGER
);

CREATE TABLE IF NOT EXISTS ref_channels (
    channel_id INTEGER PRIMARY KEY,
    content_distributor_id INTEGER NOT NULL
);
";

/// Indexes expected by the reconcile, ledger, and detect query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_events_start_ad",
    "idx_events_session_time",
    "idx_events_source_file",
    "idx_staged_events_batch_session",
    "ux_session_aggregates_key",
    "idx_session_aggregates_start",
];
