//! Reconnection policy for auto-connected devices.
//!
//! A device registered with [`ConnectionManager::auto_connect`](crate::manager::ConnectionManager::auto_connect)
//! is reconnected after the platform drops its link. Attempts are spaced by
//! [`ReconnectOptions::delay_for_attempt`] and stop once the attempt budget
//! is spent, or when the device is explicitly disconnected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options for automatic reconnection.
///
/// Delays are in milliseconds so the options read naturally from a config
/// file. Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    /// Maximum number of reconnection attempts (None = unlimited).
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt.
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to use exponential backoff.
    pub use_exponential_backoff: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            use_exponential_backoff: true,
        }
    }
}

impl ReconnectOptions {
    /// Create options with a fixed delay (no backoff).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay_ms: delay.as_millis() as u64,
            use_exponential_backoff: false,
            ..Default::default()
        }
    }

    /// Set maximum number of reconnection attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether `attempts` completed attempts exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Calculate the delay before attempt number `attempt`, counting from 0.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        if !self.use_exponential_backoff {
            return initial;
        }

        let delay_ms =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms as u64).min(Duration::from_millis(self.max_delay_ms))
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is >= 1.0
    /// - `initial_delay_ms` is > 0
    /// - `max_delay_ms` >= `initial_delay_ms`
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config("backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay_ms == 0 {
            return Err(Error::invalid_config("initial_delay_ms must be > 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::invalid_config(
                "max_delay_ms must be >= initial_delay_ms",
            ));
        }
        Ok(())
    }
}
