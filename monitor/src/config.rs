//! Configuration module for the esmon monitor.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `ESMON_SOCKET_PATH` | No | `/var/run/esmon.sock` | Socket the peer connects to |
//! | `ESMON_ALLOWED_UIDS` | No | (any) | Comma-separated uids allowed to register |
//! | `ESMON_QUEUE_SIZE` | No | 1024 | Outbound event queue capacity per peer |
//! | `ESMON_USER_CACHE_SIZE` | No | 256 | Capacity of the uid to user name cache |
//!
//! # Example
//!
//! ```no_run
//! use esmon_monitor::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Socket: {}", config.socket_path.display());
//! ```

use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use thiserror::Error;

use crate::ipc::{PeerPolicy, DEFAULT_QUEUE_SIZE};

/// Default socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/esmon.sock";

/// Default uid to name cache capacity.
const DEFAULT_USER_CACHE_SIZE: usize = 256;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for the esmon monitor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the Unix domain socket peers connect to.
    pub socket_path: PathBuf,

    /// Uids allowed to connect. `None` admits any local user.
    pub allowed_uids: Option<Vec<u32>>,

    /// Capacity of each peer's outbound queue.
    pub queue_size: usize,

    /// Capacity of the uid to user name cache.
    pub user_cache_size: NonZeroUsize,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `ESMON_ALLOWED_UIDS` contains something other than uids
    /// - `ESMON_QUEUE_SIZE` or `ESMON_USER_CACHE_SIZE` is not a positive integer
    pub fn from_env() -> Result<Self, ConfigError> {
        let socket_path = env::var("ESMON_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET_PATH));

        let allowed_uids = match env::var("ESMON_ALLOWED_UIDS") {
            Ok(val) => Some(parse_uids(&val)?),
            Err(_) => None,
        };

        let queue_size = parse_positive("ESMON_QUEUE_SIZE", DEFAULT_QUEUE_SIZE)?;
        let user_cache_size =
            NonZeroUsize::new(parse_positive("ESMON_USER_CACHE_SIZE", DEFAULT_USER_CACHE_SIZE)?)
                .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            socket_path,
            allowed_uids,
            queue_size,
            user_cache_size,
        })
    }

    /// The connection policy derived from `allowed_uids`.
    #[must_use]
    pub fn peer_policy(&self) -> PeerPolicy {
        match &self.allowed_uids {
            Some(uids) => PeerPolicy::allow_uids(uids.iter().copied()),
            None => PeerPolicy::allow_any(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            allowed_uids: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            user_cache_size: NonZeroUsize::new(DEFAULT_USER_CACHE_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
        }
    }
}

fn parse_uids(val: &str) -> Result<Vec<u32>, ConfigError> {
    let uids = val
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "ESMON_ALLOWED_UIDS".to_string(),
                message: format!("expected comma-separated uids, got '{s}'"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if uids.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "ESMON_ALLOWED_UIDS".to_string(),
            message: "allow-list is set but empty".to_string(),
        });
    }
    Ok(uids)
}

fn parse_positive(key: &str, default: usize) -> Result<usize, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(default);
    };
    let size = val.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected positive integer, got '{val}'"),
    })?;
    if size == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value must be greater than 0".to_string(),
        });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Helper to run tests with isolated environment variables.
    /// Clears all ESMON_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("ESMON_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("ESMON_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_defaults() {
        with_clean_env(|| {
            let config = Config::from_env().expect("should parse empty env");

            assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
            assert!(config.allowed_uids.is_none());
            assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);
            assert_eq!(config.user_cache_size.get(), DEFAULT_USER_CACHE_SIZE);
            assert!(config.peer_policy().is_unrestricted());
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("ESMON_SOCKET_PATH", "/tmp/esmon-test.sock");
            env::set_var("ESMON_ALLOWED_UIDS", " 501, 502 ");
            env::set_var("ESMON_QUEUE_SIZE", "64");
            env::set_var("ESMON_USER_CACHE_SIZE", "8");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.socket_path, PathBuf::from("/tmp/esmon-test.sock"));
            assert_eq!(config.allowed_uids, Some(vec![501, 502]));
            assert_eq!(config.queue_size, 64);
            assert_eq!(config.user_cache_size.get(), 8);

            let policy = config.peer_policy();
            assert!(policy.is_authorized(502));
            assert!(!policy.is_authorized(0));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_uid_list() {
        with_clean_env(|| {
            env::set_var("ESMON_ALLOWED_UIDS", "501,alice");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "ESMON_ALLOWED_UIDS" && message.contains("alice")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_empty_uid_list_rejected() {
        with_clean_env(|| {
            env::set_var("ESMON_ALLOWED_UIDS", " , ");
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn test_zero_queue_size_rejected() {
        with_clean_env(|| {
            env::set_var("ESMON_QUEUE_SIZE", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "ESMON_QUEUE_SIZE" && message.contains("greater than 0")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_cache_size() {
        with_clean_env(|| {
            env::set_var("ESMON_USER_CACHE_SIZE", "lots");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "ESMON_USER_CACHE_SIZE"
            ));
        });
    }
}
