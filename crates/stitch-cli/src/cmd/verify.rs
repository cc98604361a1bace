use std::io::Write;

use anyhow::Result;
use stitch_core::aggregate::AggregateCache;
use stitch_core::error::ErrorCode;

use super::CmdContext;
use crate::output::render;

/// Compare the aggregate cache with direct aggregation over the event store.
///
/// # Errors
///
/// Returns an error (exit status 1) when any group has drifted.
pub fn run_verify(ctx: &CmdContext) -> Result<()> {
    let conn = ctx.open_store()?;
    let report = AggregateCache::new(&conn)
        .verify()
        .map_err(|e| ctx.fail(ErrorCode::StoreUnavailable, format!("{e:#}")))?;

    render(ctx.output, &report, |r, w| {
        for m in &r.mismatches {
            let cached = m.cached.as_ref().map_or(0, |a| a.count);
            let recomputed = m.recomputed.as_ref().map_or(0, |a| a.count);
            writeln!(w, "FAIL {} (cached {cached} rows, store {recomputed})", m.key)?;
        }
        if r.is_consistent() {
            writeln!(w, "verify: {} groups consistent", r.groups_checked)
        } else {
            writeln!(
                w,
                "verify: {} of {} groups drifted",
                r.mismatches.len(),
                r.groups_checked
            )
        }
    })?;

    if report.is_consistent() {
        Ok(())
    } else {
        Err(ctx.fail(
            ErrorCode::AggregateDrift,
            format!("{} aggregate groups drifted", report.mismatches.len()),
        ))
    }
}
