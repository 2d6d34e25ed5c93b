//! esmon Monitor - privileged file event relay.
//!
//! This binary serves decoded file events to one registered peer over a
//! local socket.
//!
//! # Commands
//!
//! - `esmon-monitor run --replay <FILE>`: Serve events from a recording
//! - `esmon-monitor decode <FILE>`: Print the wire records of a recording
//!
//! # Environment Variables
//!
//! See the [`config`](esmon_monitor::config) module for available
//! configuration options.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use esmon_monitor::config::Config;
use esmon_monitor::decoder::Decoder;
use esmon_monitor::replay::ReplaySource;
use esmon_monitor::service::{decode_recording, MonitorService};
use esmon_monitor::users::{CachedUsers, SystemUsers};

/// esmon Monitor - privileged file event relay.
///
/// Subscribes to file lifecycle events and relays them as JSON records to
/// a single registered peer over a Unix domain socket.
#[derive(Parser, Debug)]
#[command(name = "esmon-monitor")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    ESMON_SOCKET_PATH      Socket path (default: /var/run/esmon.sock)
    ESMON_ALLOWED_UIDS     Comma-separated uids allowed to register (default: any)
    ESMON_QUEUE_SIZE       Outbound queue capacity per peer (default: 1024)
    ESMON_USER_CACHE_SIZE  uid to user name cache capacity (default: 256)
    RUST_LOG               Log filter (default: info)

EXAMPLES:
    # Serve a recording once, one message every 200ms
    esmon-monitor run --replay session.jsonl --interval-ms 200

    # Show what a recording decodes to
    esmon-monitor decode session.jsonl

    # Structured logs for a log collector
    esmon-monitor --log-format json run --replay session.jsonl
")]
struct Cli {
    /// Log line format on stderr.
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the monitor service.
    ///
    /// Binds the socket and starts delivering events once a peer registers.
    Run {
        /// JSON-lines recording of kernel messages to serve.
        #[arg(long, value_name = "FILE")]
        replay: PathBuf,

        /// Pause between recorded messages, in milliseconds.
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Start over after the last recorded message.
        #[arg(long)]
        repeat: bool,
    },

    /// Decode a recording and print one wire record per line.
    Decode {
        /// JSON-lines recording of kernel messages.
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Command::Run {
            replay,
            interval_ms,
            repeat,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_monitor(replay, Duration::from_millis(interval_ms), repeat))
        }
        Command::Decode { file } => run_decode(file),
    }
}

/// Runs the monitor service until SIGINT or SIGTERM.
async fn run_monitor(replay: PathBuf, interval: Duration, repeat: bool) -> Result<()> {
    let source = ReplaySource::from_path(&replay)
        .with_context(|| format!("Failed to load recording {}", replay.display()))?
        .with_interval(interval)
        .with_repeat(repeat);

    let service = MonitorService::from_env(Arc::new(source), SystemUsers)
        .context("Failed to start monitor service")?;

    let dispatcher = service.dispatcher();
    service.run(wait_for_shutdown()).await;

    if let Some(failure) = dispatcher.last_failure() {
        warn!(error = %failure, "Event source never started successfully");
    }
    info!("Monitor shutdown complete");
    Ok(())
}

/// Decodes every supported message in a recording to stdout.
fn run_decode(file: PathBuf) -> Result<()> {
    let users = CachedUsers::new(SystemUsers, Config::default().user_cache_size);
    let decoder = Decoder::new(Arc::new(users));

    let written = decode_recording(&file, &decoder, &mut io::stdout().lock())
        .with_context(|| format!("Failed to decode {}", file.display()))?;
    info!(records = written, "Decoded recording");
    Ok(())
}

/// Initializes the tracing subscriber on stderr.
///
/// Stdout is reserved for `decode` output.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init(),
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_defaults_to_text() {
        let cli = Cli::try_parse_from(["esmon-monitor", "decode", "session.jsonl"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn log_format_json_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "esmon-monitor",
            "run",
            "--replay",
            "session.jsonl",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Run { repeat: false, .. }));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["esmon-monitor", "--log-format", "xml", "decode", "f"]).is_err());
    }
}
