//! Viewer configuration from environment variables.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ESMON_SOCKET_PATH` | `/var/run/esmon.sock` | Monitor socket to connect to |
//! | `ESMON_RECONNECT` | `true` | Reconnect with backoff after the connection ends |

use std::env;
use std::path::PathBuf;

use esmon_monitor::config::DEFAULT_SOCKET_PATH;

use crate::error::ConfigError;

/// Configuration for the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Monitor socket to connect to.
    pub socket_path: PathBuf,

    /// Whether to reconnect after the connection ends.
    pub reconnect: bool,
}

impl ViewerConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `ESMON_RECONNECT` is not a
    /// boolean.
    pub fn from_env() -> Result<Self, ConfigError> {
        let socket_path = env::var("ESMON_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH));

        let reconnect = match env::var("ESMON_RECONNECT") {
            Ok(val) => parse_bool(&val).ok_or_else(|| ConfigError::Invalid {
                key: "ESMON_RECONNECT".to_string(),
                reason: format!("expected true or false, got '{val}'"),
            })?,
            Err(_) => true,
        };

        Ok(Self {
            socket_path,
            reconnect,
        })
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Sets or clears env vars for the lifetime of the guard.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new(vars: &[(&'static str, Option<&str>)]) -> Self {
            let saved = vars
                .iter()
                .map(|(key, value)| {
                    let old = env::var(key).ok();
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                    (*key, old)
                })
                .collect();
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let _guard = EnvGuard::new(&[("ESMON_SOCKET_PATH", None), ("ESMON_RECONNECT", None)]);

        let config = ViewerConfig::from_env().unwrap();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert!(config.reconnect);
    }

    #[test]
    #[serial]
    fn test_overrides() {
        let _guard = EnvGuard::new(&[
            ("ESMON_SOCKET_PATH", Some("/tmp/viewer.sock")),
            ("ESMON_RECONNECT", Some("Off")),
        ]);

        let config = ViewerConfig::from_env().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/viewer.sock"));
        assert!(!config.reconnect);
    }

    #[test]
    #[serial]
    fn test_invalid_reconnect() {
        let _guard = EnvGuard::new(&[("ESMON_RECONNECT", Some("sometimes"))]);

        let err = ViewerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "ESMON_RECONNECT"));
    }
}
