//! Agio CLI — inspect and mutate a session store from the command line.

#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI program intentionally uses stdio

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agio::checkpoint::{CheckpointManager, ForkModifications};
use agio::error::Error;
use agio::store::sqlite::SqliteStore;
use agio::store::{LogFilter, RunFilter, SessionStore as _, SharedStore};

/// Agio — agent orchestration runtime store tools
#[derive(Parser)]
#[command(name = "agio")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the sqlite session store
    #[arg(short, long, env = "AGIO_DB", default_value = "agio.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the ordered steps of a session
    Steps(StepsArgs),

    /// List runs, optionally filtered by session
    Runs(RunsArgs),

    /// List LLM call logs, optionally filtered by run
    Logs(LogsArgs),

    /// Show aggregate store statistics
    Stats,

    /// Fork a session at a sequence into a fresh session
    Fork(ForkArgs),

    /// Truncate a session suffix so the next run retries from there
    Retry(RetryArgs),

    /// List checkpoints, optionally filtered by run
    Checkpoints(CheckpointsArgs),

    /// Print the waterfall view of a persisted trace
    Trace(TraceArgs),
}

#[derive(Args)]
struct StepsArgs {
    /// The session to list
    session_id: String,

    /// First sequence to include
    #[arg(long, default_value_t = 1)]
    from: u64,

    /// Last sequence to include
    #[arg(long)]
    to: Option<u64>,
}

#[derive(Args)]
struct RunsArgs {
    /// Restrict to one session
    #[arg(long)]
    session: Option<String>,
}

#[derive(Args)]
struct LogsArgs {
    /// Restrict to one run
    #[arg(long)]
    run: Option<String>,
}

#[derive(Args)]
struct ForkArgs {
    /// The source session
    session_id: String,

    /// Copy steps 1..=at_sequence
    at_sequence: u64,

    /// Replace the content of the last user step in the copied prefix
    #[arg(long)]
    query: Option<String>,
}

#[derive(Args)]
struct RetryArgs {
    /// The session to truncate
    session_id: String,

    /// Delete steps with sequence >= from_sequence
    from_sequence: u64,
}

#[derive(Args)]
struct CheckpointsArgs {
    /// Restrict to one run
    #[arg(long)]
    run: Option<String>,
}

#[derive(Args)]
struct TraceArgs {
    /// The root run id of the trace
    run_id: String,
}

/// Map runtime errors to the exit-code contract: 2 config/validation,
/// 3 run failed, 4 cancelled, 5 timeout.
fn exit_code(err: &Error) -> u8 {
    match err {
        Error::Config { .. }
        | Error::NotFound { .. }
        | Error::MalformedMessage { .. } => 2,
        Error::Model { .. } => 3,
        Error::Cancelled => 4,
        Error::Timeout { .. } => 5,
        _ => 1,
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agio={default}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn execute(cli: Cli) -> Result<(), Error> {
    let store: SharedStore = Arc::new(SqliteStore::open(&cli.db)?);

    match cli.command {
        Commands::Steps(args) => {
            let steps = store
                .list_steps(&args.session_id, Some((args.from, args.to)))
                .await?;
            for step in steps {
                println!("{}", serde_json::to_string(&step)?);
            }
        }
        Commands::Runs(args) => {
            let filter = args.session.map_or_else(RunFilter::any, RunFilter::session);
            for run in store.list_runs(&filter).await? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        Commands::Logs(args) => {
            let filter = args.run.map_or_else(LogFilter::any, LogFilter::run);
            for log in store.list_llm_call_logs(&filter).await? {
                println!("{}", serde_json::to_string(&log)?);
            }
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Fork(args) => {
            let manager = CheckpointManager::new(store);
            let modifications = args.query.map(|query| ForkModifications {
                modified_query: Some(query),
            });
            let session = manager
                .fork(&args.session_id, args.at_sequence, modifications)
                .await?;
            println!("{}", session.session_id);
        }
        Commands::Retry(args) => {
            let manager = CheckpointManager::new(store);
            let deleted = manager.retry(&args.session_id, args.from_sequence).await?;
            println!("deleted {deleted} step(s)");
        }
        Commands::Checkpoints(args) => {
            for checkpoint in store.list_checkpoints(args.run.as_deref()).await? {
                println!(
                    "{}  run={}  at_sequence={}  {}",
                    checkpoint.checkpoint_id,
                    checkpoint.run_id,
                    checkpoint.at_sequence,
                    checkpoint.description.unwrap_or_default()
                );
            }
        }
        Commands::Trace(args) => {
            let trace = store.get_trace(&args.run_id).await?;
            for row in trace.waterfall() {
                println!(
                    "{:>8}ms  {:>8}ms  {}{} [{}]",
                    row.offset_ms,
                    row.duration_ms,
                    "  ".repeat(row.depth),
                    row.name,
                    serde_json::to_string(&row.kind)?.trim_matches('"'),
                );
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}
