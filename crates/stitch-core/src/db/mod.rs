//! SQLite store utilities.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so fraud queries read a committed snapshot while a
//!   batch cycle appends
//! - `busy_timeout = 5s` to ride out short writer/reader contention
//! - `synchronous = NORMAL`, which is durable at WAL checkpoint granularity

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the store database, apply runtime pragmas, and migrate
/// the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails, or
/// if the file was written by a newer schema than this binary understands.
pub fn open_store(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }
    }

    let mut conn =
        Connection::open(path).with_context(|| format!("open store database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    check_not_newer(&conn)?;
    migrations::migrate(&mut conn).context("apply store migrations")?;

    Ok(conn)
}

/// Open a fresh in-memory store with the full schema.
///
/// # Errors
///
/// Returns an error if migration fails.
pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("open in-memory store")?;
    migrations::migrate(&mut conn).context("apply store migrations")?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

fn check_not_newer(conn: &Connection) -> Result<()> {
    let version = migrations::current_schema_version(conn).context("read schema version")?;
    if version > migrations::LATEST_SCHEMA_VERSION {
        anyhow::bail!(
            "{}: store schema v{version} is newer than supported v{}",
            crate::error::ErrorCode::CorruptStore.code(),
            migrations::LATEST_SCHEMA_VERSION
        );
    }
    Ok(())
}

/// Current wall-clock time in epoch microseconds.
#[must_use]
pub fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
