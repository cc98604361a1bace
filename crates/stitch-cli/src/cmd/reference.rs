use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand};
use stitch_core::enrich::{ReferenceFile, save_reference};
use stitch_core::error::ErrorCode;

use super::CmdContext;
use crate::output::{pretty_kv, render};

#[derive(Subcommand, Debug)]
pub enum ReferenceCommand {
    #[command(
        about = "Load enrichment reference data into the store",
        after_help = "EXAMPLES:\n    # Load ads, campaigns, and channels from a JSON file\n    stitch reference load reference.json"
    )]
    Load(LoadArgs),
}

/// Arguments for `stitch reference load`.
#[derive(Args, Debug)]
pub struct LoadArgs {
    /// JSON file with `ads`, `campaigns`, and `channels` arrays
    /// (default: `[reference] path`).
    pub file: Option<PathBuf>,
}

/// Upsert reference rows used to enrich future batches.
///
/// # Errors
///
/// Returns an error if no file is given or configured, or if the file
/// cannot be parsed or written.
pub fn run_reference(command: &ReferenceCommand, ctx: &CmdContext) -> Result<()> {
    match command {
        ReferenceCommand::Load(args) => run_load(args, ctx),
    }
}

fn run_load(args: &LoadArgs, ctx: &CmdContext) -> Result<()> {
    let Some(path) = args.file.clone().or_else(|| ctx.config.reference.path.clone()) else {
        return Err(ctx.fail(
            ErrorCode::ReferenceLoadFailed,
            "no reference file given and [reference] path is not set",
        ));
    };

    let data = ReferenceFile::from_json_path(&path)
        .map_err(|e| ctx.fail(ErrorCode::ReferenceLoadFailed, format!("{e:#}")))?;
    let mut conn = ctx.open_store()?;
    let counts = save_reference(&mut conn, &data)
        .map_err(|e| ctx.fail(ErrorCode::StoreUnavailable, format!("{e:#}")))?;

    render(ctx.output, &counts, |c, w| {
        pretty_kv(w, "ads", c.ads.to_string())?;
        pretty_kv(w, "campaigns", c.campaigns.to_string())?;
        pretty_kv(w, "channels", c.channels.to_string())
    })
}
