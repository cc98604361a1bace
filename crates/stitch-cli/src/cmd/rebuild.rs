use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use stitch_core::aggregate::AggregateCache;
use stitch_core::db::now_us;
use stitch_core::error::ErrorCode;
use stitch_core::lock::{IngestLock, lock_path_for};

use super::CmdContext;
use crate::output::render;

#[derive(Debug, Serialize)]
struct RebuildReport {
    groups: usize,
}

/// Recompute the aggregate cache from the event store.
///
/// Holds the ingest lock so no cycle extends the cache mid-rebuild.
///
/// # Errors
///
/// Returns an error if the lock or the rebuild transaction fails.
pub fn run_rebuild(ctx: &CmdContext) -> Result<()> {
    let store = &ctx.config.store;
    let _lock = IngestLock::acquire(&lock_path_for(&store.path), store.lock_timeout())
        .map_err(|e| ctx.fail(e.code(), &e))?;
    let mut conn = ctx.open_store()?;

    let groups = AggregateCache::rebuild(&mut conn, now_us())
        .map_err(|e| ctx.fail(ErrorCode::StoreUnavailable, format!("{e:#}")))?;

    render(ctx.output, &RebuildReport { groups }, |r, w| {
        writeln!(w, "rebuild: {} aggregate groups", r.groups)
    })
}
