use std::io::Write;

use anyhow::Result;
use stitch_core::error::ErrorCode;
use stitch_core::event::format_micros;
use stitch_core::ledger::FileLedger;

use super::CmdContext;
use crate::output::render;

/// List committed source files.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn run_files(ctx: &CmdContext) -> Result<()> {
    let conn = ctx.open_store()?;
    let files = FileLedger::new(&conn)
        .committed_files()
        .map_err(|e| ctx.fail(ErrorCode::StoreUnavailable, format!("{e:#}")))?;

    render(ctx.output, &files, |files, w| {
        if files.is_empty() {
            return writeln!(w, "files: none committed");
        }
        for f in files {
            writeln!(
                w,
                "{:<40} {:>8} rows  {}  {}",
                f.source_file_name,
                f.row_count,
                format_micros(f.source_file_timestamp_us),
                f.batch_id
            )?;
        }
        Ok(())
    })
}
