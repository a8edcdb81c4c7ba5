//! gangctl: read-only status of gang groups.
//!
//! Reads the status snapshot the daemon publishes; it never opens the
//! state store itself.
//!
//! Exit codes: 0 success, 1 group not found, 2 snapshot missing or
//! unreadable.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use gangway_state::GroupPhase;

mod commands;

use commands::OutputFormat;

#[derive(Parser)]
#[command(
    name = "gangctl",
    about = "Gangway: gang scheduling status",
    version,
    propagate_version = true
)]
struct Cli {
    /// Status snapshot written by gangwayd.
    #[arg(long, global = true, default_value = "/var/lib/gangway/status.json")]
    status_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List groups, optionally filtered by phase and queue.
    List {
        /// Only groups in this phase (e.g. Queued, Scheduled).
        #[arg(long)]
        phase: Option<GroupPhase>,
        /// Only groups in this queue.
        #[arg(long)]
        queue: Option<String>,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Show one group: members, phase, time in phase.
    Describe {
        group: String,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::List {
            phase,
            queue,
            format,
        } => commands::list::run(&cli.status_file, phase, queue.as_deref(), format),
        Commands::Describe { group, format } => {
            commands::describe::run(&cli.status_file, &group, format)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::exit_code(&e))
        }
    }
}
