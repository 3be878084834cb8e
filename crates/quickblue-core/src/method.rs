//! Inbound method calls.
//!
//! A [`MethodCall`] is the decoded form of one client request: an operation
//! name plus its argument map. Field names use camelCase. The names used by
//! older clients are accepted as aliases.
//!
//! ```
//! use quickblue_core::MethodCall;
//!
//! let call: MethodCall = serde_json::from_str(
//!     r#"{"method":"readValue","deviceId":"42","serviceId":"180f","characteristicId":"2a19"}"#,
//! )
//! .unwrap();
//! assert_eq!(call.name(), "readValue");
//! ```

use serde::{Deserialize, Serialize};

use quickblue_types::{DeviceAddress, NotifyMode, WriteMode};

use crate::error::Result;

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum MethodCall {
    /// Whether a radio is present and powered on.
    #[serde(alias = "isBluetoothAvailable")]
    IsAvailable,
    /// Start forwarding advertisements, optionally only those that
    /// advertise one service.
    StartScan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_id: Option<String>,
    },
    /// Stop forwarding advertisements.
    StopScan,
    /// Connect to a device.
    Connect { device_id: DeviceAddress },
    /// Connect to a device and reconnect whenever the link drops, until
    /// an explicit disconnect.
    AutoConnect { device_id: DeviceAddress },
    /// Disconnect from a device.
    Disconnect { device_id: DeviceAddress },
    /// Enumerate services and characteristics.
    DiscoverServices { device_id: DeviceAddress },
    /// Enable or disable value-changed delivery.
    SetNotifiable {
        device_id: DeviceAddress,
        #[serde(alias = "service")]
        service_id: String,
        #[serde(alias = "characteristic")]
        characteristic_id: String,
        #[serde(alias = "bleInputProperty")]
        mode: NotifyMode,
    },
    /// Negotiate the link MTU.
    RequestMtu {
        device_id: DeviceAddress,
        expected_mtu: u16,
    },
    /// Read a characteristic.
    ReadValue {
        device_id: DeviceAddress,
        #[serde(alias = "service")]
        service_id: String,
        #[serde(alias = "characteristic")]
        characteristic_id: String,
    },
    /// Write a characteristic.
    WriteValue {
        device_id: DeviceAddress,
        #[serde(alias = "service")]
        service_id: String,
        #[serde(alias = "characteristic")]
        characteristic_id: String,
        #[serde(alias = "value")]
        bytes: Vec<u8>,
        #[serde(alias = "bleOutputProperty")]
        mode: WriteMode,
    },
    /// Read the link RSSI.
    ReadRssi { device_id: DeviceAddress },
}

impl MethodCall {
    /// Decode a call from a JSON object.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decode a call from an already parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// The method name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            MethodCall::IsAvailable => "isAvailable",
            MethodCall::StartScan { .. } => "startScan",
            MethodCall::StopScan => "stopScan",
            MethodCall::Connect { .. } => "connect",
            MethodCall::AutoConnect { .. } => "autoConnect",
            MethodCall::Disconnect { .. } => "disconnect",
            MethodCall::DiscoverServices { .. } => "discoverServices",
            MethodCall::SetNotifiable { .. } => "setNotifiable",
            MethodCall::RequestMtu { .. } => "requestMtu",
            MethodCall::ReadValue { .. } => "readValue",
            MethodCall::WriteValue { .. } => "writeValue",
            MethodCall::ReadRssi { .. } => "readRssi",
        }
    }

    /// The target device, for calls that have one.
    pub fn device_id(&self) -> Option<DeviceAddress> {
        match self {
            MethodCall::IsAvailable | MethodCall::StartScan { .. } | MethodCall::StopScan => None,
            MethodCall::Connect { device_id }
            | MethodCall::AutoConnect { device_id }
            | MethodCall::Disconnect { device_id }
            | MethodCall::DiscoverServices { device_id }
            | MethodCall::SetNotifiable { device_id, .. }
            | MethodCall::RequestMtu { device_id, .. }
            | MethodCall::ReadValue { device_id, .. }
            | MethodCall::WriteValue { device_id, .. }
            | MethodCall::ReadRssi { device_id } => Some(*device_id),
        }
    }
}


/// Property-based tests for method call decoding.
///
/// These tests verify that decoding never panics and that device ids
/// survive a trip through the wire format.
///
/// Run with: `cargo test -p quickblue-core method::proptests`
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decoding_arbitrary_text_never_panics(input in ".{0,200}") {
            let _ = MethodCall::from_json(&input);
        }

        #[test]
        fn connect_accepts_any_48_bit_address(value in 0u64..=0xffff_ffff_ffff) {
            let json = format!(r#"{{"method":"connect","deviceId":"{value}"}}"#);
            let call = MethodCall::from_json(&json).unwrap();
            prop_assert_eq!(call.device_id().map(DeviceAddress::as_u64), Some(value));
        }

        #[test]
        fn connect_rejects_wider_addresses(value in 0x1_0000_0000_0000u64..) {
            let json = format!(r#"{{"method":"connect","deviceId":"{value}"}}"#);
            prop_assert!(MethodCall::from_json(&json).is_err());
        }
    }
}
