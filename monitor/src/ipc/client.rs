//! Connecting side of the IPC channel.
//!
//! # Example
//!
//! ```no_run
//! use esmon_monitor::ipc::PeerConnection;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut conn = PeerConnection::connect("/var/run/esmon.sock").await?;
//! if conn.register().await? {
//!     while let Some(event) = conn.next_event().await? {
//!         println!("{}", event.description());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::protocol::{read_frame, write_frame, Frame, FrameError};
use crate::types::FileEvent;

/// Failure to reach the service socket.
#[derive(Error, Debug)]
#[error("failed to connect to {path}: {source}")]
pub struct ConnectError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Failure during the register handshake.
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("service closed the connection before acknowledging")]
    Closed,

    #[error("service sent an unexpected frame during registration")]
    UnexpectedFrame,
}

/// Failure while waiting for events.
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("connection is not registered")]
    NotRegistered,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("service sent an unexpected frame")]
    UnexpectedFrame,

    #[error("malformed event record: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ReceiveError {
    /// Whether the connection is still usable after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// A connection to the monitor service.
pub struct PeerConnection {
    stream: UnixStream,
    registered: bool,
    pending: VecDeque<Vec<u8>>,
}

impl PeerConnection {
    /// Connects to the service socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] if the socket is missing or refuses the
    /// connection.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ConnectError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ConnectError {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "Connected to monitor");

        Ok(Self {
            stream,
            registered: false,
            pending: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Performs the register handshake and returns the service's answer.
    ///
    /// Once registered, further calls return `Ok(true)` without another
    /// round trip. Events that arrive ahead of the acknowledgment are kept
    /// for [`next_event`](Self::next_event).
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError`] on I/O failure, early close, or a protocol
    /// violation.
    pub async fn register(&mut self) -> Result<bool, RegisterError> {
        if self.registered {
            return Ok(true);
        }

        write_frame(&mut self.stream, &Frame::Register).await?;
        loop {
            match read_frame(&mut self.stream).await? {
                Some(Frame::Ack(accepted)) => {
                    self.registered = accepted;
                    debug!(accepted, "Registration acknowledged");
                    return Ok(accepted);
                }
                Some(Frame::Event(body)) => self.pending.push_back(body),
                Some(Frame::Register) => return Err(RegisterError::UnexpectedFrame),
                None => return Err(RegisterError::Closed),
            }
        }
    }

    /// Waits for the next event record.
    ///
    /// Returns `Ok(None)` when the service closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiveError::NotRegistered`] before a successful
    /// [`register`](Self::register). A [`ReceiveError::Decode`] affects only
    /// that record; the connection remains usable.
    pub async fn next_event(&mut self) -> Result<Option<FileEvent>, ReceiveError> {
        if !self.registered {
            return Err(ReceiveError::NotRegistered);
        }

        let body = match self.pending.pop_front() {
            Some(body) => body,
            None => match read_frame(&mut self.stream).await? {
                Some(Frame::Event(body)) => body,
                Some(_) => return Err(ReceiveError::UnexpectedFrame),
                None => return Ok(None),
            },
        };
        trace!(bytes = body.len(), "Received event record");
        Ok(Some(FileEvent::from_wire(&body)?))
    }
}
