//! Platform-agnostic types for the quickblue BLE bridge.
//!
//! This crate holds everything the request layer and the BLE core agree on
//! without depending on a radio stack:
//!
//! - Byte codec helpers for values and manufacturer data
//! - Canonical service/characteristic identifier handling
//! - Device addresses and the small mode enums used by GATT operations
//! - Parse errors for all of the above
//!
//! # Example
//!
//! ```
//! use quickblue_types::{DeviceAddress, NotifyMode, uuids};
//!
//! let address: DeviceAddress = "281474976710655".parse().unwrap();
//! assert_eq!(address.mac_string(), "FF:FF:FF:FF:FF:FF");
//!
//! let mode: NotifyMode = "notification".parse().unwrap();
//! assert!(mode.is_enabled());
//!
//! assert_eq!(
//!     uuids::normalize_uuid("2A37").unwrap(),
//!     "00002a37-0000-1000-8000-00805f9b34fb"
//! );
//! ```

pub mod codec;
pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{ConnectionState, DescriptorValue, DeviceAddress, NotifyMode, WriteMode};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    // --- Serialization tests ---

    #[test]
    fn test_device_address_serializes_as_decimal_string() {
        let address: DeviceAddress = "42".parse().unwrap();
        assert_eq!(serde_json::to_string(&address).unwrap(), "\"42\"");

        let parsed: DeviceAddress = serde_json::from_str("\"187723572702975\"").unwrap();
        assert_eq!(parsed.as_u64(), 0xaabb_ccdd_eeff);
    }

    #[test]
    fn test_device_address_rejects_invalid_json() {
        assert!(serde_json::from_str::<DeviceAddress>("\"abc\"").is_err());
        assert!(serde_json::from_str::<DeviceAddress>("42").is_err());
    }

    #[test]
    fn test_connection_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }

    #[test]
    fn test_mode_deserialization() {
        let mode: NotifyMode = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(mode, NotifyMode::Disabled);

        let mode: WriteMode = serde_json::from_str("\"withoutResponse\"").unwrap();
        assert_eq!(mode, WriteMode::WithoutResponse);

        assert!(serde_json::from_str::<WriteMode>("\"with_response\"").is_err());
    }

    // --- ParseError tests ---

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InvalidUuid("zz".to_string());
        assert_eq!(err.to_string(), "Invalid UUID 'zz'");

        let err = ParseError::InvalidDeviceId("x".to_string());
        assert!(err.to_string().contains("decimal Bluetooth address"));
    }
}
