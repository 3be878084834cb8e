//! Runtime configuration for the core.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconnect::ReconnectOptions;

/// Default capacity of the connector event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Default capacity of the scan result channel.
pub const DEFAULT_SCAN_CAPACITY: usize = 100;

/// Settings for a [`QuickBlue`](crate::QuickBlue) instance.
///
/// Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickBlueConfig {
    /// Buffered connector events per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Buffered scan results per subscriber before the oldest are dropped.
    pub scan_capacity: usize,
    /// Reconnection policy for auto-connected devices.
    pub reconnect: ReconnectOptions,
}

impl Default for QuickBlueConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            scan_capacity: DEFAULT_SCAN_CAPACITY,
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl QuickBlueConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connector event channel capacity.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the scan result channel capacity.
    #[must_use]
    pub fn scan_capacity(mut self, capacity: usize) -> Self {
        self.scan_capacity = capacity;
        self
    }

    /// Set the reconnection policy for auto-connected devices.
    #[must_use]
    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()
    }
}
