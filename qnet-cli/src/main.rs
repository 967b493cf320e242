//! Qnet CLI - Command-line interface
//!
//! Runs the built-in queueing network scenarios from the command line.

mod commands;

use clap::Parser;
use qnet_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "qnet")]
#[command(about = "A discrete-event simulator for multi-class queueing networks")]
struct Cli {
    /// Console log level (RUST_LOG overrides it)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Directory for the per-run trace file
    #[arg(long, global = true)]
    logs_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    commands::handle_command(cli.command)
}
