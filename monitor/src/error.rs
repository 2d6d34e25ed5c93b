//! Error types for the esmon monitor.
//!
//! Each concern keeps its own error enum next to the code that raises it;
//! [`MonitorError`] gathers them for callers that drive the whole service.

use thiserror::Error;

use crate::config::ConfigError;
use crate::replay::ReplayError;

/// Errors that can occur during monitor operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket or file system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A recording could not be loaded.
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),
}

/// Result type alias using [`MonitorError`].
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_replay_errors() {
        let err: MonitorError = crate::replay::parse_recording("not json").unwrap_err().into();
        assert!(err.to_string().starts_with("replay error: invalid message on line 1"));
    }

    #[test]
    fn wraps_config_errors() {
        let err: MonitorError = ConfigError::InvalidValue {
            key: "ESMON_QUEUE_SIZE".to_string(),
            message: "value must be greater than 0".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("configuration error: invalid value for ESMON_QUEUE_SIZE"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn open_missing() -> Result<()> {
            std::fs::read("/nonexistent/esmon")?;
            Ok(())
        }
        assert!(matches!(open_missing(), Err(MonitorError::Io(_))));
    }
}
