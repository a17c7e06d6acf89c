use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

mod logs;
mod search;
mod tail;
mod types;

use search::{SearchOptions, TimeOrder};
use tail::{TailConfig, TailEngine};

/// aptjournal - Watches apt history.log and parses events into JSON
#[derive(Parser, Debug)]
#[command(name = "aptjournal")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print increasingly detailed progress to stderr (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Continuously tail the history log, emitting one JSON record per event
    Tail {
        /// Input log file
        #[arg(short, long, default_value = "/var/log/apt/history.log")]
        log_file: PathBuf,

        /// Output to a file instead of stdout
        #[arg(short, long)]
        out_file: Option<PathBuf>,

        /// Directory holding the resume position between runs
        #[arg(short, long, default_value = "/var/lib/aptjournal")]
        state_dir: PathBuf,

        /// Validate startup (state, input file, watches) and exit
        #[arg(long)]
        dry_run: bool,
    },

    /// Search history logs for events matching the given criteria
    Search {
        /// Log file, or a directory of (possibly gzipped) rotated logs
        #[arg(short, long, default_value = "/var/log/apt/history.log")]
        log_file: PathBuf,

        /// Order output ascending/descending by start timestamp
        #[arg(long, value_enum, default_value = "asc")]
        time_order: TimeOrder,

        /// Filter start time of search [default: 1 week ago]
        #[arg(long, value_name = "2010-12-31T23:59:59")]
        start_timestamp: Option<String>,

        /// Filter end time of search [default: now]
        #[arg(long, value_name = "2011-12-31T23:59:59")]
        end_timestamp: Option<String>,

        /// Filter by specific event id
        #[arg(long, value_name = "uuid")]
        event_id: Option<String>,

        /// Filter command line (regex)
        #[arg(long, value_name = "text")]
        command_line: Option<String>,

        /// Filter package name (regex)
        #[arg(long, value_name = "pkg")]
        package_name: Option<String>,

        /// Filter package version (regex)
        #[arg(long, value_name = "ver")]
        package_version: Option<String>,

        /// Filter APT operation (install|reinstall|upgrade|remove|purge)
        #[arg(long, value_name = "op")]
        operation: Option<String>,

        /// Filter requesting user name (regex)
        #[arg(long, value_name = "name")]
        user_name: Option<String>,

        /// Filter requesting user id
        #[arg(long, value_name = "uid")]
        user_uid: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;
    if let Err(e) = &result {
        eprintln!("Error: {e:#}");
    }
    result
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Tail {
            log_file,
            out_file,
            state_dir,
            dry_run,
        } => {
            let shutdown = CancellationToken::new();
            spawn_signal_listener(shutdown.clone())?;

            let engine = TailEngine::new(TailConfig {
                log_path: log_file,
                output_path: out_file,
                state_dir,
                dry_run,
            });
            engine.run(shutdown).await
        }

        Command::Search {
            log_file,
            time_order,
            start_timestamp,
            end_timestamp,
            event_id,
            command_line,
            package_name,
            package_version,
            operation,
            user_name,
            user_uid,
        } => {
            let options = SearchOptions {
                event_id,
                start_timestamp,
                end_timestamp,
                command_line,
                package_name,
                package_version,
                operation,
                user_name,
                user_uid,
            };
            search::run(&log_file, time_order, &options)
        }
    }
}

/// Cancel the token on SIGINT, SIGTERM, or SIGHUP. The tailing engine
/// observes the token at block boundaries and shuts down cleanly.
fn spawn_signal_listener(shutdown: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
        }
        info!("shutdown signal received, finishing current block");
        shutdown.cancel();
    });

    Ok(())
}
