//! esmon Viewer - prints file events relayed by the esmon monitor.
//!
//! # Environment Variables
//!
//! See the [`config`](esmon_viewer::config) module for available options.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use esmon_viewer::{watch, Backoff, OutputFormat, ViewerConfig, ViewerError};

/// esmon Viewer - prints file events relayed by the esmon monitor.
#[derive(Parser, Debug)]
#[command(name = "esmon-viewer")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    ESMON_SOCKET_PATH  Monitor socket (default: /var/run/esmon.sock)
    ESMON_RECONNECT    Reconnect after the connection ends (default: true)
    RUST_LOG           Log filter (default: info)

EXAMPLES:
    # Follow events, reconnecting when the monitor restarts
    esmon-viewer

    # Print raw wire records for a single connection
    esmon-viewer --json --once
")]
struct Cli {
    /// Print one JSON record per line instead of the readable form.
    #[arg(long)]
    json: bool,

    /// Exit when the first connection ends instead of reconnecting.
    #[arg(long)]
    once: bool,

    /// Monitor socket path, overriding ESMON_SOCKET_PATH.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = ViewerConfig::from_env().context("Failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if cli.once {
        config.reconnect = false;
    }
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Pretty
    };

    tokio::select! {
        result = follow(&config, format) => result,
        () = wait_for_shutdown() => Ok(()),
    }
}

/// Watches until a non-transient error, or until the first connection ends
/// when reconnecting is disabled.
async fn follow(config: &ViewerConfig, format: OutputFormat) -> Result<()> {
    let mut backoff = Backoff::new();
    let mut stdout = io::stdout();

    loop {
        match watch(&config.socket_path, format, &mut stdout).await {
            Ok(printed) => {
                info!(printed, "Connection ended");
                if printed > 0 {
                    backoff.reset();
                }
            }
            Err(e @ ViewerError::Rejected) => {
                return Err(e).context("Monitor refused this viewer");
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Connection failed");
            }
            Err(e) => return Err(e).context("Viewer stopped"),
        }

        if !config.reconnect {
            return Ok(());
        }
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// Initializes the tracing subscriber on stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
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
        () = ctrl_c => info!("Received SIGINT, exiting"),
        () = terminate => info!("Received SIGTERM, exiting"),
    }
}
