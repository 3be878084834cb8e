//! Asynchronous BLE bridge core.
//!
//! This crate sits between a request layer (method calls arriving from an
//! application) and a Bluetooth Low Energy stack. It keeps one agent per
//! connected device and runs every GATT operation as an independent task
//! whose outcome is reported on an event stream.
//!
//! # Features
//!
//! - **Connection lifecycle**: connect, explicit and platform-initiated
//!   disconnect, exactly-once teardown
//! - **Cache-first lookups**: services and characteristics are cached per
//!   device and re-fetched when a handle goes stale
//! - **Notifications**: descriptor writes and value callbacks kept in step
//! - **Scanning**: advertisement forwarding with name resolution
//! - **Pluggable platform**: btleplug for real hardware, an in-memory mock
//!   for tests
//!
//! # Event model
//!
//! | Request | Success event | Failure |
//! |---------|---------------|---------|
//! | `connect` | `connection_state: connected` | `connection_state: disconnected` |
//! | `discoverServices` | `service_discovered` per service | `service_discovered` without a service |
//! | `readValue` | `characteristic_value` | silent |
//! | `writeValue` | none | silent |
//! | `setNotifiable` | `characteristic_value` per change | silent |
//! | `requestMtu` | `mtu_negotiated` | silent |
//! | `readRssi` | `rssi_read` | silent |
//!
//! # Quick Start
//!
//! ```no_run
//! use quickblue_core::{ConnectorEvent, QuickBlue, QuickBlueConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = QuickBlue::btleplug(QuickBlueConfig::default()).await?;
//!     let mut events = bridge.subscribe();
//!
//!     bridge.connect("209588367454282".parse()?)?;
//!     while let Ok(event) = events.recv().await {
//!         if let ConnectorEvent::ConnectionState { device_id, state } = event {
//!             println!("{device_id}: {state}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod btle;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gatt;
pub mod manager;
pub mod method;
pub mod mock;
pub mod platform;
pub mod reconnect;
pub mod scan;

// Re-export types
pub use quickblue_types::{
    ConnectionState, DescriptorValue, DeviceAddress, NotifyMode, ParseError, WriteMode,
};
pub use quickblue_types::{codec, uuids};

// Re-export core types
pub use agent::{DeviceAgent, SubscriptionTurn};
pub use btle::BtleplugPlatform;
pub use client::QuickBlue;
pub use config::QuickBlueConfig;
pub use error::{Error, Result};
pub use events::{ConnectorEvent, EventDispatcher, EventReceiver, ScanReceiver, ScanResult};
pub use gatt::{GattOrchestrator, deliver_value_changed};
pub use manager::ConnectionManager;
pub use method::MethodCall;
pub use platform::{
    BleDevice, BlePlatform, ConnectionStatus, GattCharacteristic, GattService, GattStatus,
    RadioState,
};
pub use reconnect::ReconnectOptions;
pub use scan::ScanWatcher;
