use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use stitch_core::db::now_us;
use stitch_core::event::{EventKind, MICROS_PER_SEC, format_micros, to_micros};
use stitch_core::fraud::{FraudEvaluator, FraudFlag};

use super::CmdContext;
use crate::output::{OutputMode, render_line};

/// Arguments for `stitch detect`.
#[derive(Args, Debug, Default)]
pub struct DetectArgs {
    /// Evaluation time as RFC 3339 (default: now).
    #[arg(long, value_name = "RFC3339", value_parser = parse_rfc3339)]
    pub now: Option<DateTime<Utc>>,

    /// Trailing window in seconds (overrides `[fraud] window_secs`).
    #[arg(long, value_name = "SECS")]
    pub window_secs: Option<u64>,

    /// Event kind code counted as a click.
    #[arg(long, value_name = "CODE")]
    pub click: Option<i64>,

    /// Event kind code that clears a click.
    #[arg(long, value_name = "CODE")]
    pub terminal: Option<i64>,

    /// Abandon the scan after this many milliseconds.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp '{value}': {e}"))
}

/// Stream fraud flags for the trailing window.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the scan times out;
/// flags found before the timeout are still printed.
pub fn run_detect(args: &DetectArgs, ctx: &CmdContext) -> Result<()> {
    let now = args.now.map_or_else(now_us, to_micros);
    let mut params = ctx.config.fraud.detect_params(now);
    if let Some(secs) = args.window_secs {
        params.window_us = i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SEC);
    }
    if let Some(code) = args.click {
        params.click = EventKind(code);
    }
    if let Some(code) = args.terminal {
        params.terminal = EventKind(code);
    }
    if let Some(ms) = args.timeout_ms {
        params.timeout = Some(Duration::from_millis(ms));
    }

    let conn = ctx.open_store()?;
    let scan = FraudEvaluator::new(&conn)
        .detect(params)
        .map_err(|e| ctx.fail(e.code(), &e))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut flagged = 0_usize;
    for item in scan {
        let flag = item.map_err(|e| ctx.fail(e.code(), &e))?;
        if flagged == 0 && ctx.output == OutputMode::Human {
            writeln!(
                out,
                "{:<27} {:<20} {:>8} {:>6} {:>6}  events",
                "session_start", "session", "ad", "clicks", "count"
            )?;
        }
        render_line(ctx.output, &mut out, &flag, render_flag)?;
        flagged += 1;
    }

    if ctx.output == OutputMode::Human && flagged == 0 {
        writeln!(out, "detect: no flagged sessions")?;
    }
    tracing::info!(flagged, "fraud scan complete");
    Ok(())
}

fn render_flag(flag: &FraudFlag, w: &mut dyn Write) -> io::Result<()> {
    let ad = flag
        .ad_id
        .map_or_else(|| "-".to_string(), |ad| ad.to_string());
    let events: Vec<String> = flag.all_events.iter().map(ToString::to_string).collect();
    writeln!(
        w,
        "{:<27} {:<20} {:>8} {:>6} {:>6}  [{}]",
        format_micros(flag.session_start_us),
        flag.session_id,
        ad,
        flag.fraudulent_click_count,
        flag.count,
        events.join(",")
    )
}
