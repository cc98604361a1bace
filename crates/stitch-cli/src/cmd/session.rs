use std::io::Write;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use stitch_core::error::ErrorCode;
use stitch_core::event::format_micros;
use stitch_core::session::{SessionGroup, SessionIndex};

use super::CmdContext;
use crate::output::{CliError, pretty_section, render, render_error};

/// Arguments for `stitch session`.
#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Session id to inspect.
    pub session_id: String,
}

#[derive(Debug, Serialize)]
struct SessionView {
    session_id: String,
    groups: Vec<SessionGroup>,
}

/// List every session-start group stored for a session.
///
/// More than one group means a later batch revealed an earlier event after
/// rows had already been committed under the older start.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the session is unknown.
pub fn run_session(args: &SessionArgs, ctx: &CmdContext) -> Result<()> {
    let conn = ctx.open_store()?;
    let groups = SessionIndex::new(&conn)
        .session_groups(&args.session_id)
        .map_err(|e| ctx.fail(ErrorCode::StoreUnavailable, format!("{e:#}")))?;

    if groups.is_empty() {
        let msg = format!("session '{}' has no committed events", args.session_id);
        render_error(
            ctx.output,
            &CliError {
                suggestion: Some("List committed files with 'stitch files'".to_string()),
                ..CliError::new(&msg)
            },
        )?;
        anyhow::bail!("{msg}");
    }

    let view = SessionView {
        session_id: args.session_id.clone(),
        groups,
    };
    render(ctx.output, &view, |v, w| {
        pretty_section(w, &format!("session {}", v.session_id))?;
        for g in &v.groups {
            writeln!(
                w,
                "{}  rows={}  first={}  last={}",
                format_micros(g.session_start_us),
                g.row_count,
                format_micros(g.min_event_time_us),
                format_micros(g.max_event_time_us)
            )?;
        }
        if v.groups.len() > 1 {
            writeln!(w, "note: {} start groups (earliest is current)", v.groups.len())?;
        }
        Ok(())
    })
}
