#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use stitch_core::config::{CONFIG_FILE_NAME, load_config};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "stitch: incremental session stitching and click-fraud detection",
    long_about = None
)]
struct Cli {
    /// Log at debug level when STITCH_LOG is unset.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./stitch.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    const fn output_mode(&self) -> OutputMode {
        OutputMode::from_json_flag(self.json)
    }

    fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Ingest",
        about = "Run one batch cycle",
        long_about = "Ingest every source file not yet committed as one atomic batch.",
        after_help = "EXAMPLES:\n    # Ingest from the configured source directory\n    stitch ingest\n\n    # Ingest from another directory\n    stitch ingest --source /var/log/clicks\n\n    # Emit machine-readable output\n    stitch ingest --json"
    )]
    Ingest(cmd::ingest::IngestArgs),

    #[command(
        next_help_heading = "Read",
        about = "Flag clicks without completion",
        long_about = "Stream session/ad groups in the trailing window that clicked but never completed.",
        after_help = "EXAMPLES:\n    # Evaluate the last day\n    stitch detect\n\n    # Evaluate as of a fixed instant over one hour\n    stitch detect --now 2024-02-15T12:00:00Z --window-secs 3600\n\n    # Emit one JSON object per flag\n    stitch detect --json"
    )]
    Detect(cmd::detect::DetectArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show session-start groups of a session"
    )]
    Session(cmd::session::SessionArgs),

    #[command(next_help_heading = "Read", about = "List committed source files")]
    Files,

    #[command(
        next_help_heading = "Maintenance",
        about = "Check aggregates against the event store",
        long_about = "Recompute every aggregate group from committed events and report drift. Exits non-zero on drift."
    )]
    Verify,

    #[command(
        next_help_heading = "Maintenance",
        about = "Recompute the aggregate cache",
        after_help = "EXAMPLES:\n    # Repair drift reported by verify\n    stitch rebuild"
    )]
    Rebuild,

    #[command(next_help_heading = "Maintenance", about = "Manage enrichment reference data")]
    Reference {
        #[command(subcommand)]
        command: cmd::reference::ReferenceCommand,
    },

    #[command(
        next_help_heading = "Maintenance",
        about = "Generate shell completions",
        after_help = "EXAMPLES:\n    # Bash\n    stitch completions bash > ~/.local/share/bash-completion/completions/stitch"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

/// Filter used when `STITCH_LOG` is unset.
const fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "stitch=debug,stitch_core=debug,info"
    } else {
        "stitch=info,stitch_core=info,warn"
    }
}

fn init_tracing(verbose: bool) {
    let verbose = verbose || env::var("DEBUG").is_ok();
    let filter = EnvFilter::try_from_env("STITCH_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let format = env::var("STITCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(command = ?cli.command, "starting");

    let output = cli.output_mode();
    let config = match load_config(&cli.config_path()) {
        Ok(config) => config,
        Err(e) => {
            render_error(output, &CliError::coded(e.code(), e.to_string()))?;
            return Err(e.into());
        }
    };
    let ctx = cmd::CmdContext { config, output };

    match cli.command {
        Commands::Ingest(ref args) => cmd::ingest::run_ingest(args, &ctx),
        Commands::Detect(ref args) => cmd::detect::run_detect(args, &ctx),
        Commands::Session(ref args) => cmd::session::run_session(args, &ctx),
        Commands::Files => cmd::files::run_files(&ctx),
        Commands::Verify => cmd::verify::run_verify(&ctx),
        Commands::Rebuild => cmd::rebuild::run_rebuild(&ctx),
        Commands::Reference { ref command } => cmd::reference::run_reference(command, &ctx),
        Commands::Completions(ref args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    }
}
