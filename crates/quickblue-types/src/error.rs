//! Error types for identifier and buffer parsing in quickblue-types.

use thiserror::Error;

/// Errors that can occur when parsing identifiers or argument values.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in quickblue-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A device identifier was not a decimal 48-bit address.
    #[error("Invalid device id '{0}': expected a decimal Bluetooth address")]
    InvalidDeviceId(String),

    /// A service or characteristic identifier could not be parsed.
    #[error("Invalid UUID '{0}'")]
    InvalidUuid(String),

    /// An enumerated argument had an unrecognized value.
    #[error("Invalid {kind} '{value}'")]
    InvalidValue {
        /// What kind of value was expected (e.g. "notify mode").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}

impl ParseError {
    /// Create an invalid value error for an enumerated argument.
    pub fn invalid_value(kind: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            kind,
            value: value.into(),
        }
    }
}

/// Result type alias using quickblue-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
