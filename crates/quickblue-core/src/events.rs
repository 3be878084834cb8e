//! Outbound events pushed to clients.
//!
//! Events are decoupled from the requests that cause them. Connection,
//! discovery, value and MTU events share one stream; scan results travel on
//! a separate one.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use quickblue_types::{ConnectionState, DeviceAddress};

/// Events produced by connections and GATT operations.
///
/// All events are serializable so a transport can forward them as-is.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConnectorEvent {
    /// A device connected, failed to connect, or disconnected.
    ConnectionState {
        device_id: DeviceAddress,
        state: ConnectionState,
    },
    /// One service was discovered.
    ///
    /// `service_id` is absent when discovery failed for the whole device.
    /// `characteristic_ids` is absent when only the characteristics of this
    /// service could not be enumerated.
    ServiceDiscovered {
        device_id: DeviceAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        characteristic_ids: Option<Vec<String>>,
    },
    /// A characteristic value was read or notified.
    CharacteristicValue {
        device_id: DeviceAddress,
        characteristic_id: String,
        value: Vec<u8>,
    },
    /// The link MTU was negotiated.
    MtuNegotiated { mtu: u16 },
    /// The link RSSI was read.
    RssiRead { device_id: DeviceAddress, rssi: i16 },
}

impl ConnectorEvent {
    /// The device this event is about, if any.
    pub fn device_id(&self) -> Option<DeviceAddress> {
        match self {
            ConnectorEvent::ConnectionState { device_id, .. }
            | ConnectorEvent::ServiceDiscovered { device_id, .. }
            | ConnectorEvent::CharacteristicValue { device_id, .. }
            | ConnectorEvent::RssiRead { device_id, .. } => Some(*device_id),
            ConnectorEvent::MtuNegotiated { .. } => None,
        }
    }

    pub(crate) fn connection_state(device_id: DeviceAddress, state: ConnectionState) -> Self {
        ConnectorEvent::ConnectionState { device_id, state }
    }
}

/// An advertisement forwarded to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Advertiser address.
    pub device_id: DeviceAddress,
    /// Resolved public name, or the advertised local name.
    pub name: String,
    /// Company identifier (little-endian) followed by the payload of the
    /// first manufacturer data element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_data_head: Option<Vec<u8>>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Receiver for connector events.
pub type EventReceiver = broadcast::Receiver<ConnectorEvent>;

/// Receiver for scan results.
pub type ScanReceiver = broadcast::Receiver<ScanResult>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug)]
pub struct EventDispatcher<E = ConnectorEvent> {
    sender: broadcast::Sender<E>,
}

impl<E> Clone for EventDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone> EventDispatcher<E> {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: E) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> broadcast::Sender<E> {
        self.sender.clone()
    }
}

impl<E: Clone> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new(100)
    }
}
