//! The radio stack as seen by the core.
//!
//! Everything the core needs from a BLE stack is expressed by the traits in
//! this module, so connection management and GATT orchestration never name a
//! concrete library. [`crate::btle`] implements them over btleplug and
//! [`crate::mock`] implements them for tests.
//!
//! Handles are reference counted trait objects. Callbacks are plain closures
//! that may be invoked on any thread, including from inside another
//! platform call, so implementations must not hold internal locks while
//! invoking them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use quickblue_types::{DescriptorValue, DeviceAddress, WriteMode};

use crate::error::Result;

/// Shared handle to a platform device.
pub type DeviceHandle = Arc<dyn BleDevice>;
/// Shared handle to a primary service.
pub type ServiceHandle = Arc<dyn GattService>;
/// Shared handle to a characteristic.
pub type CharacteristicHandle = Arc<dyn GattCharacteristic>;
/// Shared handle to an advertisement watcher.
pub type WatcherHandle = Arc<dyn AdvertisementWatcher>;

/// Callback for connection status changes.
pub type ConnectionStatusHandler = Arc<dyn Fn(DeviceAddress, ConnectionStatus) + Send + Sync>;
/// Callback for characteristic value changes.
pub type ValueChangedHandler = Arc<dyn Fn(ValueChanged) + Send + Sync>;
/// Callback for received advertisements.
pub type AdvertisementHandler = Arc<dyn Fn(ReceivedAdvertisement) + Send + Sync>;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Registration token returned when a callback is added.
///
/// Tokens are unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventToken(u64);

impl EventToken {
    /// Allocate a fresh token.
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw token value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Non-success completion codes reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum GattStatus {
    /// The remote device could not be reached.
    Unreachable,
    /// The remote device answered with a protocol error.
    ProtocolError,
    /// Access to the attribute was denied.
    AccessDenied,
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Unreachable => write!(f, "unreachable"),
            GattStatus::ProtocolError => write!(f, "protocol error"),
            GattStatus::AccessDenied => write!(f, "access denied"),
        }
    }
}

/// The platform's view of a device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Link is up.
    Connected,
    /// Link is down.
    Disconnected,
}

/// State of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    /// Present and powered on.
    On,
    /// Present but powered off.
    Off,
    /// Missing, or its state cannot be determined.
    Unknown,
}

/// Payload of a value-changed callback.
///
/// Both fields are optional because platforms may deliver a change after
/// the characteristic or its buffer has gone away.
#[derive(Clone)]
pub struct ValueChanged {
    /// The characteristic whose value changed.
    pub characteristic: Option<CharacteristicHandle>,
    /// The new value.
    pub value: Option<Bytes>,
}

impl fmt::Debug for ValueChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueChanged")
            .field(
                "characteristic",
                &self.characteristic.as_ref().map(|c| c.uuid()),
            )
            .field("value", &self.value)
            .finish()
    }
}

/// One manufacturer-specific data element of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    /// Bluetooth SIG company identifier.
    pub company_id: u16,
    /// Payload after the company identifier.
    pub data: Vec<u8>,
}

/// An advertisement observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAdvertisement {
    /// Advertiser address.
    pub address: DeviceAddress,
    /// Name carried in the advertisement itself.
    pub local_name: Option<String>,
    /// Manufacturer data elements in platform order.
    pub manufacturer_data: Vec<ManufacturerData>,
    /// Advertised service identifiers.
    pub services: Vec<Uuid>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Restricts which advertisements a watcher reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvertisementFilter {
    /// Only report advertisers of this service. `None` reports everything.
    pub service: Option<Uuid>,
}

impl AdvertisementFilter {
    /// A filter that reports every advertisement.
    pub fn any() -> Self {
        Self::default()
    }

    /// A filter for advertisers of one service.
    pub fn service(service: Uuid) -> Self {
        Self {
            service: Some(service),
        }
    }

    /// Whether an advertisement passes the filter.
    pub fn matches(&self, advertisement: &ReceivedAdvertisement) -> bool {
        match self.service {
            Some(service) => advertisement.services.contains(&service),
            None => true,
        }
    }
}

/// Entry point into a BLE stack.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Report whether a radio is present and powered.
    async fn radio_state(&self) -> Result<RadioState>;

    /// Resolve a device from its address.
    ///
    /// `Ok(None)` means the platform knows of no such device.
    async fn device_from_address(&self, address: DeviceAddress) -> Result<Option<DeviceHandle>>;

    /// Create a new, stopped advertisement watcher.
    fn advertisement_watcher(&self) -> Result<WatcherHandle>;
}

/// A remote device.
#[async_trait]
pub trait BleDevice: Send + Sync {
    /// The device address.
    fn address(&self) -> DeviceAddress;

    /// The device's public name, if the platform knows one.
    async fn name(&self) -> Result<Option<String>>;

    /// Current link status.
    async fn connection_status(&self) -> ConnectionStatus;

    /// Enumerate primary services, establishing the link if needed.
    async fn gatt_services(&self) -> Result<Vec<ServiceHandle>>;

    /// Register a connection status callback.
    async fn add_connection_status_handler(
        &self,
        handler: ConnectionStatusHandler,
    ) -> Result<EventToken>;

    /// Unregister a connection status callback.
    fn remove_connection_status_handler(&self, token: EventToken) -> Result<()>;

    /// Negotiate the link MTU; `expected` is advisory.
    ///
    /// Returns the maximum payload size the platform settled on.
    async fn negotiate_mtu(&self, expected: u16) -> Result<u16>;

    /// Read the link RSSI in dBm.
    async fn rssi(&self) -> Result<i16>;

    /// Release the device. Called once, at teardown.
    fn close(&self);
}

/// A primary service on a remote device.
#[async_trait]
pub trait GattService: Send + Sync {
    /// Service identifier.
    fn uuid(&self) -> Uuid;

    /// Whether this handle can still be used.
    fn is_valid(&self) -> bool;

    /// Enumerate the service's characteristics.
    async fn characteristics(&self) -> Result<Vec<CharacteristicHandle>>;
}

/// A characteristic on a remote device.
#[async_trait]
pub trait GattCharacteristic: Send + Sync {
    /// Characteristic identifier.
    fn uuid(&self) -> Uuid;

    /// Identifier of the owning service, if it can still be resolved.
    fn service_uuid(&self) -> Option<Uuid>;

    /// Address of the owning device, if it can still be resolved.
    fn device_address(&self) -> Option<DeviceAddress>;

    /// Whether this handle can still be used.
    fn is_valid(&self) -> bool;

    /// Read the current value from the remote device.
    async fn read_value(&self) -> Result<Bytes>;

    /// Write a value with the requested acknowledgment mode.
    async fn write_value(&self, value: Bytes, mode: WriteMode) -> Result<()>;

    /// Write the client characteristic configuration descriptor.
    async fn write_client_configuration(&self, value: DescriptorValue) -> Result<()>;

    /// Register a value-changed callback.
    async fn add_value_changed_handler(&self, handler: ValueChangedHandler) -> Result<EventToken>;

    /// Unregister a value-changed callback.
    fn remove_value_changed_handler(&self, token: EventToken) -> Result<()>;
}

/// Source of advertisement events.
#[async_trait]
pub trait AdvertisementWatcher: Send + Sync {
    /// Register a received-advertisement callback.
    fn add_received_handler(&self, handler: AdvertisementHandler) -> EventToken;

    /// Unregister a received-advertisement callback.
    fn remove_received_handler(&self, token: EventToken) -> Result<()>;

    /// Start watching, or switch a running watcher to `filter`.
    async fn start(&self, filter: AdvertisementFilter) -> Result<()>;

    /// Stop watching.
    async fn stop(&self) -> Result<()>;
}
