pub mod completions;
pub mod detect;
pub mod files;
pub mod ingest;
pub mod rebuild;
pub mod reference;
pub mod session;
pub mod verify;

use std::fmt::Display;

use rusqlite::Connection;
use stitch_core::config::StitchConfig;
use stitch_core::db;
use stitch_core::error::ErrorCode;

use crate::output::{CliError, OutputMode, render_error};

/// Resolved configuration and output mode shared by every handler.
#[derive(Debug, Clone)]
pub struct CmdContext {
    pub config: StitchConfig,
    pub output: OutputMode,
}

impl CmdContext {
    /// Open the configured store, reporting failure as `E2001`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or migrated.
    pub fn open_store(&self) -> anyhow::Result<Connection> {
        db::open_store(&self.config.store.path).map_err(|e| {
            let code = if format!("{e:#}").contains(ErrorCode::CorruptStore.code()) {
                ErrorCode::CorruptStore
            } else {
                ErrorCode::StoreUnavailable
            };
            self.fail(code, format!("{e:#}"))
        })
    }

    /// Render `message` as a coded error and return it for `?` propagation.
    pub fn fail(&self, code: ErrorCode, message: impl Display) -> anyhow::Error {
        let message = message.to_string();
        if let Err(render_err) = render_error(self.output, &CliError::coded(code, &message)) {
            tracing::warn!(error = %render_err, "failed to render error");
        }
        anyhow::anyhow!("{code}: {message}")
    }
}
