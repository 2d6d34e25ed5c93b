//! Reconnect delay with exponential backoff and jitter.
//!
//! Delays start at 1s, double after every failed attempt up to 60s, and
//! each wait is randomized by ±25%.

use std::time::Duration;

use rand::Rng;

/// Initial reconnect delay in seconds.
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Maximum reconnect delay in seconds.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// Tracks the delay before the next reconnect attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
        }
    }

    /// The un-jittered delay the next wait is based on.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the jittered delay to wait now and doubles the base delay.
    pub fn next_delay(&mut self) -> Duration {
        let delay = add_jitter(self.current);
        let doubled = (self.current.as_secs() * 2).min(MAX_RETRY_DELAY_SECS);
        self.current = Duration::from_secs(doubled);
        delay
    }

    /// Resets the delay after a connection that delivered events.
    pub fn reset(&mut self) {
        self.current = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Adds ±25% jitter to a duration.
fn add_jitter(duration: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * JITTER_FACTOR;
    let jitter = rng.random_range(-jitter_range..=jitter_range);
    let new_secs = (duration.as_secs_f64() + jitter).max(0.1);
    Duration::from_secs_f64(new_secs)
}
