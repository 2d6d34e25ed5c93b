//! esmon Viewer - unprivileged peer for the esmon monitor.
//!
//! Connects to the monitor socket, registers as the active peer, and prints
//! every relayed file event. Registration is what starts event delivery on
//! the monitor side; closing the connection stops it.
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`render`]: Pretty and JSON output
//! - [`backoff`]: Reconnect delays

pub mod backoff;
pub mod config;
pub mod error;
pub mod render;

use std::io::Write;
use std::path::Path;

use esmon_monitor::ipc::PeerConnection;
use tracing::{debug, info, warn};

pub use backoff::Backoff;
pub use config::ViewerConfig;
pub use error::{ConfigError, ViewerError};
pub use render::{render, OutputFormat};

/// Runs one connection: connect, register, print events until the monitor
/// closes the connection.
///
/// Returns the number of events printed.
///
/// # Errors
///
/// Returns [`ViewerError::Rejected`] if the monitor refuses registration,
/// and the underlying error for connection, protocol, or output failures.
/// Malformed individual records are logged and skipped.
pub async fn watch<W: Write>(
    socket_path: &Path,
    format: OutputFormat,
    out: &mut W,
) -> Result<usize, ViewerError> {
    let mut conn = PeerConnection::connect(socket_path).await?;
    if !conn.register().await? {
        return Err(ViewerError::Rejected);
    }
    info!(socket = %socket_path.display(), "Registered with monitor");

    let mut printed = 0;
    loop {
        match conn.next_event().await {
            Ok(Some(event)) => {
                match render(&event, format) {
                    Ok(text) => {
                        writeln!(out, "{text}")?;
                        out.flush()?;
                        printed += 1;
                    }
                    Err(e) => warn!(error = %e, "Failed to render event"),
                }
            }
            Ok(None) => {
                debug!(printed, "Monitor closed the connection");
                return Ok(printed);
            }
            Err(e) if e.is_recoverable() => warn!(error = %e, "Skipping malformed event"),
            Err(e) => return Err(e.into()),
        }
    }
}
