//! Error types for quickblue-core.
//!
//! Errors come in four classes:
//!
//! | Class | Variants | Surfaced as |
//! |-------|----------|-------------|
//! | Not found | [`Error::UnknownDevice`] | Rejected request, before any task is spawned |
//! | Not found | [`Error::AttributeNotFound`] | Logged inside the task |
//! | Platform status | [`Error::GattStatus`] | Logged inside the task, never retried |
//! | Platform exception | [`Error::Bluetooth`], [`Error::Platform`] | Logged inside the task with its code |
//! | Unexpected null | [`Error::DeviceReleased`] | Logged inside the task |
//! | Configuration | [`Error::InvalidConfig`] | Returned from [`QuickBlue::new`](crate::QuickBlue::new) |
//!
//! Spawned GATT tasks never return these to a caller. They end in either a
//! single negative event or silence, depending on the operation.

use thiserror::Error;

use crate::platform::GattStatus;

/// Errors that can occur while bridging requests onto the BLE stack.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from btleplug.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The platform completed an operation with a non-success status.
    #[error("GATT operation failed: {0}")]
    GattStatus(GattStatus),

    /// The platform layer terminated an operation abnormally.
    #[error("Platform error {code:#010x}: {message}")]
    Platform {
        /// Platform-specific diagnostic code.
        code: u32,
        /// Diagnostic message.
        message: String,
    },

    /// A request referenced a device with no live connection.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A service or characteristic is not present on the device.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// The device handle was released while an operation was using it.
    #[error("Device {0} handle already released")]
    DeviceReleased(String),

    /// A request argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform does not implement this operation.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// No Bluetooth adapter available.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Called outside of a tokio runtime.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// Identifier or argument parsing failed.
    #[error(transparent)]
    Parse(#[from] quickblue_types::ParseError),

    /// A method call could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a platform exception error.
    pub fn platform(code: u32, message: impl Into<String>) -> Self {
        Self::Platform {
            code,
            message: message.into(),
        }
    }

    /// Create an unknown device error.
    pub fn unknown_device(device_id: impl ToString) -> Self {
        Self::UnknownDevice(device_id.to_string())
    }

    /// Create an attribute not found error.
    pub fn attribute_not_found(attribute: impl Into<String>) -> Self {
        Self::AttributeNotFound(attribute.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a not supported error.
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported(operation.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using quickblue-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
