use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use stitch_core::cycle::{CycleReport, Pipeline};
use stitch_core::source::JsonlDirSource;

use super::CmdContext;
use crate::output::{pretty_kv, pretty_section, render};

/// Arguments for `stitch ingest`.
#[derive(Args, Debug, Default)]
pub struct IngestArgs {
    /// Source directory to scan (overrides `[source] dir`).
    #[arg(long, value_name = "DIR")]
    pub source: Option<PathBuf>,

    /// File extension of source files (overrides `[source] extension`).
    #[arg(long, value_name = "EXT")]
    pub extension: Option<String>,
}

/// Run one batch cycle over the source directory.
///
/// # Errors
///
/// Returns an error if the lock, source, or merge fails. Nothing is
/// committed in that case.
pub fn run_ingest(args: &IngestArgs, ctx: &CmdContext) -> Result<()> {
    let dir = args
        .source
        .clone()
        .unwrap_or_else(|| ctx.config.source.dir.clone());
    let extension = args
        .extension
        .clone()
        .unwrap_or_else(|| ctx.config.source.extension.clone());
    let source = JsonlDirSource::new(dir, extension);

    let mut pipeline = Pipeline::open(&ctx.config.store.path, ctx.config.store.lock_timeout())
        .map_err(|e| ctx.fail(e.code(), &e))?;
    let report = pipeline
        .run_with_stored_reference(&source)
        .map_err(|e| ctx.fail(e.code(), &e))?;

    render(ctx.output, &report, render_report)
}

fn render_report(report: &CycleReport, w: &mut dyn Write) -> io::Result<()> {
    if report.is_noop() {
        return writeln!(
            w,
            "ingest: no new rows ({} files seen, {} empty)",
            report.files_seen, report.files_empty
        );
    }
    pretty_section(w, &format!("ingest: batch {}", report.batch_id))?;
    pretty_kv(w, "files", format!("{} new / {} seen", report.files_new, report.files_seen))?;
    if report.files_empty > 0 {
        pretty_kv(w, "files empty", report.files_empty.to_string())?;
    }
    pretty_kv(w, "rows staged", report.rows_staged.to_string())?;
    pretty_kv(w, "rows appended", report.rows_appended.to_string())?;
    if report.rows_skipped > 0 {
        pretty_kv(w, "rows skipped", report.rows_skipped.to_string())?;
    }
    pretty_kv(w, "enrichment misses", report.enrichment_misses.to_string())?;
    pretty_kv(w, "sessions", report.sessions_reconciled.to_string())?;
    pretty_kv(w, "groups touched", report.groups_touched.to_string())?;
    pretty_kv(w, "elapsed", format!("{} ms", report.elapsed.as_millis()))
}
