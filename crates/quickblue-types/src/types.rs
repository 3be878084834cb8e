//! Value types shared by the request layer and the BLE core.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const ADDRESS_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A 48-bit Bluetooth device address held as an integer.
///
/// Clients refer to devices by the decimal string of this number, which is
/// also how it is displayed and serialized.
///
/// # Examples
///
/// ```
/// use quickblue_types::DeviceAddress;
///
/// let address: DeviceAddress = "42".parse().unwrap();
/// assert_eq!(address.to_string(), "42");
/// assert_eq!(address.mac_string(), "00:00:00:00:00:2A");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(into = "String", try_from = "String")
)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Create an address, rejecting values wider than 48 bits.
    pub fn new(value: u64) -> Result<Self, ParseError> {
        if value & !ADDRESS_MASK != 0 {
            return Err(ParseError::InvalidDeviceId(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Build an address from MAC bytes, most significant byte first.
    #[must_use]
    pub fn from_mac_bytes(bytes: [u8; 6]) -> Self {
        Self(
            bytes
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        )
    }

    /// MAC bytes, most significant byte first.
    #[must_use]
    pub fn to_mac_bytes(self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        [be[2], be[3], be[4], be[5], be[6], be[7]]
    }

    /// Colon-separated uppercase MAC notation.
    #[must_use]
    pub fn mac_string(self) -> String {
        self.to_mac_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidDeviceId(s.to_string()));
        }
        let value: u64 = trimmed
            .parse()
            .map_err(|_| ParseError::InvalidDeviceId(s.to_string()))?;
        Self::new(value).map_err(|_| ParseError::InvalidDeviceId(s.to_string()))
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Connection state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ConnectionState {
    /// The link is up and services were enumerated.
    Connected,
    /// The link is down, or a connect attempt failed.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Value written to a characteristic's client configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DescriptorValue {
    /// Neither notifications nor indications.
    #[default]
    None,
    /// Unacknowledged notifications.
    Notify,
    /// Acknowledged indications.
    Indicate,
}

/// Subscription mode requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum NotifyMode {
    /// Subscribe with notifications.
    Notification,
    /// Subscribe with indications.
    Indication,
    /// Unsubscribe.
    Disabled,
}

impl NotifyMode {
    /// The descriptor value that implements this mode.
    #[must_use]
    pub fn descriptor_value(self) -> DescriptorValue {
        match self {
            NotifyMode::Notification => DescriptorValue::Notify,
            NotifyMode::Indication => DescriptorValue::Indicate,
            NotifyMode::Disabled => DescriptorValue::None,
        }
    }

    /// Whether this mode turns value-changed delivery on.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        !matches!(self, NotifyMode::Disabled)
    }
}

impl FromStr for NotifyMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(NotifyMode::Notification),
            "indication" => Ok(NotifyMode::Indication),
            "disabled" => Ok(NotifyMode::Disabled),
            other => Err(ParseError::invalid_value("notify mode", other)),
        }
    }
}

/// Acknowledgment mode for a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub enum WriteMode {
    /// Wait for the remote to acknowledge.
    #[default]
    WithResponse,
    /// Fire the write without acknowledgment.
    WithoutResponse,
}

impl FromStr for WriteMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "withResponse" => Ok(WriteMode::WithResponse),
            "withoutResponse" => Ok(WriteMode::WithoutResponse),
            other => Err(ParseError::invalid_value("write mode", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_address_rejects_non_decimal() {
        for input in ["", "abc", "-1", "0x2a", "4 2", "1.5"] {
            assert!(input.parse::<DeviceAddress>().is_err(), "input {input:?}");
        }
    }

    #[test]
    fn test_device_address_rejects_over_48_bits() {
        let too_wide = (1u64 << 48).to_string();
        assert_eq!(
            too_wide.parse::<DeviceAddress>(),
            Err(ParseError::InvalidDeviceId(too_wide.clone()))
        );
        let max = ((1u64 << 48) - 1).to_string();
        assert!(max.parse::<DeviceAddress>().is_ok());
    }

    #[test]
    fn test_device_address_mac_conversion() {
        let address = DeviceAddress::from_mac_bytes([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!(address.as_u64(), 0xaabb_cc01_0203);
        assert_eq!(address.to_mac_bytes(), [0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        assert_eq!(address.mac_string(), "AA:BB:CC:01:02:03");
    }

    #[test]
    fn test_notify_mode_descriptor_mapping() {
        assert_eq!(
            NotifyMode::Notification.descriptor_value(),
            DescriptorValue::Notify
        );
        assert_eq!(
            NotifyMode::Indication.descriptor_value(),
            DescriptorValue::Indicate
        );
        assert_eq!(NotifyMode::Disabled.descriptor_value(), DescriptorValue::None);
        assert!(!NotifyMode::Disabled.is_enabled());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("indication".parse(), Ok(NotifyMode::Indication));
        assert_eq!("withoutResponse".parse(), Ok(WriteMode::WithoutResponse));

        let err = "notify".parse::<NotifyMode>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid notify mode 'notify'");
        assert!("WithResponse".parse::<WriteMode>().is_err());
    }
}
