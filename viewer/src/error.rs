//! Error types for the esmon viewer.
//!
//! - [`ConfigError`] - Invalid environment configuration
//! - [`ViewerError`] - Everything that can end a viewing session

use std::error::Error;
use std::fmt;

use esmon_monitor::ipc::{ConnectError, ReceiveError, RegisterError};
use thiserror::Error as ThisError;

/// Errors that occur during configuration loading.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value failed to parse.
    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid {
        /// The environment variable that has an invalid value.
        key: String,
        /// Description of why the value is invalid.
        reason: String,
    },
}

/// Reasons a viewing session ends with an error.
#[derive(Debug)]
pub enum ViewerError {
    /// Invalid configuration.
    Config(ConfigError),

    /// The monitor socket could not be reached.
    Connect(ConnectError),

    /// The register handshake failed.
    Register(RegisterError),

    /// The monitor answered the handshake with a refusal.
    Rejected,

    /// The connection broke while waiting for events.
    Receive(ReceiveError),

    /// Writing rendered output failed.
    Output(std::io::Error),
}

impl ViewerError {
    /// Whether trying again later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Register(_) | Self::Receive(_)
        )
    }
}

impl fmt::Display for ViewerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Connect(err) => write!(f, "{err}"),
            Self::Register(err) => write!(f, "registration failed: {err}"),
            Self::Rejected => write!(f, "monitor refused the registration"),
            Self::Receive(err) => write!(f, "connection lost: {err}"),
            Self::Output(err) => write!(f, "failed to write output: {err}"),
        }
    }
}

impl Error for ViewerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Connect(err) => Some(err),
            Self::Register(err) => Some(err),
            Self::Receive(err) => Some(err),
            Self::Output(err) => Some(err),
            Self::Rejected => None,
        }
    }
}

impl From<ConfigError> for ViewerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ConnectError> for ViewerError {
    fn from(err: ConnectError) -> Self {
        Self::Connect(err)
    }
}

impl From<RegisterError> for ViewerError {
    fn from(err: RegisterError) -> Self {
        Self::Register(err)
    }
}

impl From<ReceiveError> for ViewerError {
    fn from(err: ReceiveError) -> Self {
        Self::Receive(err)
    }
}

impl From<std::io::Error> for ViewerError {
    fn from(err: std::io::Error) -> Self {
        Self::Output(err)
    }
}
