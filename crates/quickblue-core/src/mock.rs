//! In-memory BLE platform for testing.
//!
//! This module provides a mock implementation of every trait in
//! [`crate::platform`], so connection management and GATT orchestration can
//! be exercised without BLE hardware.
//!
//! # Features
//!
//! - **Failure injection**: fail lookup, enumeration, reads, writes,
//!   descriptor writes and handler registration on demand
//! - **Latency simulation**: delay service enumeration, or hold reads until
//!   released
//! - **Callback injection**: simulate platform disconnects, value changes and
//!   received advertisements
//! - **Counters**: observe how often the core called into the platform
//!
//! Callbacks are always invoked with no internal lock held, so handlers are
//! free to call back into the mock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use quickblue_types::uuids::parse_uuid;
use quickblue_types::{DescriptorValue, DeviceAddress, WriteMode};

use crate::error::{Error, Result};
use crate::platform::{
    AdvertisementFilter, AdvertisementHandler, AdvertisementWatcher, BleDevice, BlePlatform, CharacteristicHandle,
    ConnectionStatus, ConnectionStatusHandler, DeviceHandle, EventToken, GattCharacteristic,
    GattService, GattStatus, RadioState, ReceivedAdvertisement, ServiceHandle, ValueChanged,
    ValueChangedHandler, WatcherHandle,
};

/// Diagnostic code used for injected platform exceptions.
pub const MOCK_FAILURE_CODE: u32 = 0x8000_4005;

fn mock_uuid(id: &str) -> Uuid {
    // Unparseable ids map to the nil UUID.
    parse_uuid(id).unwrap_or_default()
}

fn mock_address(value: u64) -> DeviceAddress {
    let be = value.to_be_bytes();
    DeviceAddress::from_mac_bytes([be[2], be[3], be[4], be[5], be[6], be[7]])
}

/// A mock BLE stack holding a set of known devices.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use quickblue_core::mock::{MockCharacteristic, MockDevice, MockPlatform, MockService};
///
/// let platform = Arc::new(MockPlatform::new());
/// platform.add_device(
///     MockDevice::builder(42)
///         .name("Thermometer")
///         .service(MockService::new("181a").with_characteristic(MockCharacteristic::new("2a6e")))
///         .build(),
/// );
/// assert!(platform.device(42).is_some());
/// ```
pub struct MockPlatform {
    devices: Mutex<HashMap<DeviceAddress, Arc<MockDevice>>>,
    radio: Mutex<RadioState>,
    fail_lookup: AtomicBool,
    watchers: Mutex<Vec<Arc<MockWatcher>>>,
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform")
            .field("devices", &self.devices.lock().len())
            .field("radio", &*self.radio.lock())
            .field("watchers", &self.watchers.lock().len())
            .finish()
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Create a platform with a powered radio and no devices.
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            radio: Mutex::new(RadioState::On),
            fail_lookup: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Make a device resolvable by address.
    pub fn add_device(&self, device: Arc<MockDevice>) {
        self.devices.lock().insert(device.address(), device);
    }

    /// Forget a device, so lookups for it return nothing.
    pub fn remove_device(&self, address: u64) -> Option<Arc<MockDevice>> {
        self.devices.lock().remove(&mock_address(address))
    }

    /// Get a registered device.
    pub fn device(&self, address: u64) -> Option<Arc<MockDevice>> {
        self.devices.lock().get(&mock_address(address)).cloned()
    }

    /// Set the reported radio state.
    pub fn set_radio_state(&self, state: RadioState) {
        *self.radio.lock() = state;
    }

    /// Make every device lookup fail with a platform exception.
    pub fn fail_lookup(&self, fail: bool) {
        self.fail_lookup.store(fail, Ordering::Relaxed);
    }

    /// Number of watchers created so far.
    pub fn watchers_created(&self) -> usize {
        self.watchers.lock().len()
    }

    /// The most recently created watcher.
    pub fn last_watcher(&self) -> Option<Arc<MockWatcher>> {
        self.watchers.lock().last().cloned()
    }

    /// Deliver an advertisement to every running watcher.
    pub fn advertise(&self, advertisement: ReceivedAdvertisement) {
        let watchers: Vec<_> = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.emit(advertisement.clone());
        }
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(*self.radio.lock())
    }

    async fn device_from_address(&self, address: DeviceAddress) -> Result<Option<DeviceHandle>> {
        if self.fail_lookup.load(Ordering::Relaxed) {
            return Err(Error::platform(MOCK_FAILURE_CODE, "device lookup failed"));
        }
        let device = self.devices.lock().get(&address).cloned();
        Ok(device.map(|device| device as DeviceHandle))
    }

    fn advertisement_watcher(&self) -> Result<WatcherHandle> {
        let watcher = Arc::new(MockWatcher::new());
        self.watchers.lock().push(watcher.clone());
        Ok(watcher)
    }
}

/// A mock remote device.
pub struct MockDevice {
    address: DeviceAddress,
    name: Mutex<Option<String>>,
    connected: AtomicBool,
    services: Mutex<Vec<Arc<MockService>>>,
    fail_services: AtomicBool,
    service_enumerations: AtomicU32,
    /// Simulated enumeration latency in milliseconds (0 = no delay).
    enumeration_latency_ms: AtomicU64,
    connection_handlers: Mutex<HashMap<EventToken, ConnectionStatusHandler>>,
    /// Negotiated MTU (0 = not supported).
    mtu: AtomicU16,
    rssi: AtomicI16,
    fail_rssi: AtomicBool,
    close_count: AtomicU32,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("address", &self.address)
            .field("name", &*self.name.lock())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("services", &self.services.lock().len())
            .finish()
    }
}

impl MockDevice {
    /// Start building a device with the given numeric address.
    pub fn builder(address: u64) -> MockDeviceBuilder {
        MockDeviceBuilder::new(address)
    }

    /// Get a service by id.
    pub fn service(&self, id: &str) -> Option<Arc<MockService>> {
        let uuid = mock_uuid(id);
        self.services
            .lock()
            .iter()
            .find(|service| service.uuid == uuid)
            .cloned()
    }

    /// Add a service after construction.
    pub fn add_service(&self, service: MockService) -> Arc<MockService> {
        let service = Arc::new(service);
        service.attach(self.address);
        self.services.lock().push(service.clone());
        service
    }

    /// Whether the mock link is up.
    pub fn is_connected_sync(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Rename the device.
    pub fn set_name(&self, name: Option<&str>) {
        *self.name.lock() = name.map(str::to_string);
    }

    /// Make service enumeration fail with a non-success status.
    pub fn fail_service_enumeration(&self, fail: bool) {
        self.fail_services.store(fail, Ordering::Relaxed);
    }

    /// Set simulated service enumeration latency.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_enumeration_latency(&self, latency: Duration) {
        self.enumeration_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set the MTU reported by negotiation (0 = not supported).
    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    /// Set the RSSI reported by reads.
    pub fn set_rssi(&self, rssi: i16) {
        self.rssi.store(rssi, Ordering::Relaxed);
    }

    /// Make RSSI reads fail.
    pub fn fail_rssi(&self, fail: bool) {
        self.fail_rssi.store(fail, Ordering::Relaxed);
    }

    /// Number of service enumerations performed.
    pub fn service_enumerations(&self) -> u32 {
        self.service_enumerations.load(Ordering::Relaxed)
    }

    /// Number of registered connection status callbacks.
    pub fn connection_handler_count(&self) -> usize {
        self.connection_handlers.lock().len()
    }

    /// Number of times the device was released.
    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::Relaxed)
    }

    /// Drop the link and notify every registered connection callback.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.notify_status(ConnectionStatus::Disconnected);
    }

    /// Notify every registered connection callback without changing state.
    pub fn notify_status(&self, status: ConnectionStatus) {
        let handlers: Vec<_> = self.connection_handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(self.address, status);
        }
    }
}

#[async_trait]
impl BleDevice for MockDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn name(&self) -> Result<Option<String>> {
        Ok(self.name.lock().clone())
    }

    async fn connection_status(&self) -> ConnectionStatus {
        if self.connected.load(Ordering::Relaxed) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    async fn gatt_services(&self) -> Result<Vec<ServiceHandle>> {
        self.service_enumerations.fetch_add(1, Ordering::Relaxed);

        let latency = self.enumeration_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.fail_services.load(Ordering::Relaxed) {
            return Err(Error::GattStatus(GattStatus::Unreachable));
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(self
            .services
            .lock()
            .iter()
            .map(|service| service.clone() as ServiceHandle)
            .collect())
    }

    async fn add_connection_status_handler(
        &self,
        handler: ConnectionStatusHandler,
    ) -> Result<EventToken> {
        let token = EventToken::next();
        self.connection_handlers.lock().insert(token, handler);
        Ok(token)
    }

    fn remove_connection_status_handler(&self, token: EventToken) -> Result<()> {
        self.connection_handlers
            .lock()
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| Error::invalid_argument(format!("unknown token {}", token.value())))
    }

    async fn negotiate_mtu(&self, _expected: u16) -> Result<u16> {
        match self.mtu.load(Ordering::Relaxed) {
            0 => Err(Error::not_supported("negotiate_mtu")),
            mtu => Ok(mtu),
        }
    }

    async fn rssi(&self) -> Result<i16> {
        if self.fail_rssi.load(Ordering::Relaxed) {
            return Err(Error::GattStatus(GattStatus::Unreachable));
        }
        Ok(self.rssi.load(Ordering::Relaxed))
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }
}

/// Builder for creating mock devices with custom settings.
#[derive(Default)]
pub struct MockDeviceBuilder {
    address: u64,
    name: Option<String>,
    services: Vec<MockService>,
    connected: bool,
    mtu: u16,
    rssi: i16,
}

impl MockDeviceBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new(address: u64) -> Self {
        Self {
            address,
            mtu: 247,
            rssi: -60,
            ..Self::default()
        }
    }

    /// Set the public device name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Add a primary service.
    #[must_use]
    pub fn service(mut self, service: MockService) -> Self {
        self.services.push(service);
        self
    }

    /// Start with the link already up.
    #[must_use]
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Set the MTU reported by negotiation (0 = not supported).
    #[must_use]
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the RSSI reported by reads.
    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Build the device.
    #[must_use]
    pub fn build(self) -> Arc<MockDevice> {
        let address = mock_address(self.address);
        let services = self
            .services
            .into_iter()
            .map(|service| {
                let service = Arc::new(service);
                service.attach(address);
                service
            })
            .collect();

        Arc::new(MockDevice {
            address,
            name: Mutex::new(self.name),
            connected: AtomicBool::new(self.connected),
            services: Mutex::new(services),
            fail_services: AtomicBool::new(false),
            service_enumerations: AtomicU32::new(0),
            enumeration_latency_ms: AtomicU64::new(0),
            connection_handlers: Mutex::new(HashMap::new()),
            mtu: AtomicU16::new(self.mtu),
            rssi: AtomicI16::new(self.rssi),
            fail_rssi: AtomicBool::new(false),
            close_count: AtomicU32::new(0),
        })
    }
}

/// A mock primary service.
pub struct MockService {
    uuid: Uuid,
    valid: AtomicBool,
    device_address: Mutex<Option<DeviceAddress>>,
    characteristics: Mutex<Vec<Arc<MockCharacteristic>>>,
    fail_characteristics: AtomicBool,
    characteristic_enumerations: AtomicU32,
}

impl std::fmt::Debug for MockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockService")
            .field("uuid", &self.uuid)
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .field("characteristics", &self.characteristics.lock().len())
            .finish()
    }
}

impl MockService {
    /// Create a service from a full or short identifier.
    pub fn new(id: &str) -> Self {
        Self {
            uuid: mock_uuid(id),
            valid: AtomicBool::new(true),
            device_address: Mutex::new(None),
            characteristics: Mutex::new(Vec::new()),
            fail_characteristics: AtomicBool::new(false),
            characteristic_enumerations: AtomicU32::new(0),
        }
    }

    /// Add a characteristic while building.
    #[must_use]
    pub fn with_characteristic(self, characteristic: MockCharacteristic) -> Self {
        self.characteristics.lock().push(Arc::new(characteristic));
        self
    }

    fn attach(&self, address: DeviceAddress) {
        *self.device_address.lock() = Some(address);
        for characteristic in self.characteristics.lock().iter() {
            characteristic.attach(address, self.uuid);
        }
    }

    /// Get a characteristic by id.
    pub fn characteristic(&self, id: &str) -> Option<Arc<MockCharacteristic>> {
        let uuid = mock_uuid(id);
        self.characteristics
            .lock()
            .iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .cloned()
    }

    /// Replace any characteristic with the same id, as a re-enumeration would.
    pub fn replace_characteristic(
        &self,
        characteristic: MockCharacteristic,
    ) -> Arc<MockCharacteristic> {
        let characteristic = Arc::new(characteristic);
        if let Some(address) = *self.device_address.lock() {
            characteristic.attach(address, self.uuid);
        }
        let mut characteristics = self.characteristics.lock();
        characteristics.retain(|existing| existing.uuid != characteristic.uuid);
        characteristics.push(characteristic.clone());
        characteristic
    }

    /// Make characteristic enumeration fail with a non-success status.
    pub fn fail_characteristic_enumeration(&self, fail: bool) {
        self.fail_characteristics.store(fail, Ordering::Relaxed);
    }

    /// Mark this handle as stale.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    /// Number of characteristic enumerations performed.
    pub fn characteristic_enumerations(&self) -> u32 {
        self.characteristic_enumerations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GattService for MockService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    async fn characteristics(&self) -> Result<Vec<CharacteristicHandle>> {
        self.characteristic_enumerations
            .fetch_add(1, Ordering::Relaxed);
        if self.fail_characteristics.load(Ordering::Relaxed) {
            return Err(Error::GattStatus(GattStatus::ProtocolError));
        }
        Ok(self
            .characteristics
            .lock()
            .iter()
            .map(|characteristic| characteristic.clone() as CharacteristicHandle)
            .collect())
    }
}

/// A mock characteristic.
pub struct MockCharacteristic {
    uuid: Uuid,
    valid: AtomicBool,
    service_uuid: Mutex<Option<Uuid>>,
    device_address: Mutex<Option<DeviceAddress>>,
    value: Mutex<Bytes>,
    fail_reads: AtomicBool,
    read_count: AtomicU32,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
    writes: Mutex<Vec<(Bytes, WriteMode)>>,
    fail_writes: AtomicBool,
    descriptor: Mutex<DescriptorValue>,
    descriptor_writes: AtomicU32,
    fail_descriptor_writes: AtomicBool,
    fail_value_handlers: AtomicBool,
    value_handlers: Mutex<HashMap<EventToken, ValueChangedHandler>>,
}

impl std::fmt::Debug for MockCharacteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCharacteristic")
            .field("uuid", &self.uuid)
            .field("valid", &self.valid.load(Ordering::Relaxed))
            .field("descriptor", &*self.descriptor.lock())
            .field("value_handlers", &self.value_handlers.lock().len())
            .finish()
    }
}

impl MockCharacteristic {
    /// Create a characteristic from a full or short identifier.
    pub fn new(id: &str) -> Self {
        Self {
            uuid: mock_uuid(id),
            valid: AtomicBool::new(true),
            service_uuid: Mutex::new(None),
            device_address: Mutex::new(None),
            value: Mutex::new(Bytes::new()),
            fail_reads: AtomicBool::new(false),
            read_count: AtomicU32::new(0),
            read_gate: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            descriptor: Mutex::new(DescriptorValue::None),
            descriptor_writes: AtomicU32::new(0),
            fail_descriptor_writes: AtomicBool::new(false),
            fail_value_handlers: AtomicBool::new(false),
            value_handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Set the initial value while building.
    #[must_use]
    pub fn with_value(self, value: &[u8]) -> Self {
        self.set_value(value);
        self
    }

    fn attach(&self, address: DeviceAddress, service: Uuid) {
        *self.device_address.lock() = Some(address);
        *self.service_uuid.lock() = Some(service);
    }

    /// Sever the link to the owning service and device.
    pub fn detach(&self) {
        *self.device_address.lock() = None;
        *self.service_uuid.lock() = None;
    }

    /// Set the value returned by reads.
    pub fn set_value(&self, value: &[u8]) {
        *self.value.lock() = Bytes::copy_from_slice(value);
    }

    /// Make reads fail with a non-success status.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make writes fail with a platform exception.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make descriptor writes fail with a non-success status.
    pub fn fail_descriptor_writes(&self, fail: bool) {
        self.fail_descriptor_writes.store(fail, Ordering::Relaxed);
    }

    /// Make value-changed handler registration fail with a platform exception.
    pub fn fail_value_handler_registration(&self, fail: bool) {
        self.fail_value_handlers.store(fail, Ordering::Relaxed);
    }

    /// Hold every read until [`resume_reads`](Self::resume_reads) is called.
    pub fn pause_reads(&self) {
        *self.read_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Release held reads.
    pub fn resume_reads(&self) {
        if let Some(gate) = self.read_gate.lock().take() {
            gate.close();
        }
    }

    /// Mark this handle as stale.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Relaxed);
    }

    /// Number of reads started.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(Bytes, WriteMode)> {
        self.writes.lock().clone()
    }

    /// The last descriptor value written successfully.
    pub fn descriptor(&self) -> DescriptorValue {
        *self.descriptor.lock()
    }

    /// Number of descriptor writes attempted.
    pub fn descriptor_writes(&self) -> u32 {
        self.descriptor_writes.load(Ordering::Relaxed)
    }

    /// Number of registered value-changed callbacks.
    pub fn value_handler_count(&self) -> usize {
        self.value_handlers.lock().len()
    }

    /// Deliver a value change from this characteristic.
    pub fn notify(self: &Arc<Self>, value: &[u8]) {
        self.emit(ValueChanged {
            characteristic: Some(self.clone()),
            value: Some(Bytes::copy_from_slice(value)),
        });
    }

    /// Deliver an arbitrary, possibly incomplete, value change.
    pub fn emit(&self, change: ValueChanged) {
        let handlers: Vec<_> = self.value_handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(change.clone());
        }
    }
}

#[async_trait]
impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn service_uuid(&self) -> Option<Uuid> {
        *self.service_uuid.lock()
    }

    fn device_address(&self) -> Option<DeviceAddress> {
        *self.device_address.lock()
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    async fn read_value(&self) -> Result<Bytes> {
        self.read_count.fetch_add(1, Ordering::Relaxed);

        let gate = self.read_gate.lock().clone();
        if let Some(gate) = gate {
            // Closing the semaphore releases every waiter.
            let _ = gate.acquire().await;
        }

        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Error::GattStatus(GattStatus::Unreachable));
        }
        Ok(self.value.lock().clone())
    }

    async fn write_value(&self, value: Bytes, mode: WriteMode) -> Result<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(Error::platform(MOCK_FAILURE_CODE, "write failed"));
        }
        self.writes.lock().push((value, mode));
        Ok(())
    }

    async fn write_client_configuration(&self, value: DescriptorValue) -> Result<()> {
        self.descriptor_writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_descriptor_writes.load(Ordering::Relaxed) {
            return Err(Error::GattStatus(GattStatus::AccessDenied));
        }
        *self.descriptor.lock() = value;
        Ok(())
    }

    async fn add_value_changed_handler(&self, handler: ValueChangedHandler) -> Result<EventToken> {
        if self.fail_value_handlers.load(Ordering::Relaxed) {
            return Err(Error::platform(MOCK_FAILURE_CODE, "handler registration failed"));
        }
        let token = EventToken::next();
        self.value_handlers.lock().insert(token, handler);
        Ok(token)
    }

    fn remove_value_changed_handler(&self, token: EventToken) -> Result<()> {
        self.value_handlers
            .lock()
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| Error::invalid_argument(format!("unknown token {}", token.value())))
    }
}

/// A mock advertisement watcher.
#[derive(Default)]
pub struct MockWatcher {
    handlers: Mutex<HashMap<EventToken, AdvertisementHandler>>,
    running: AtomicBool,
    filter: Mutex<AdvertisementFilter>,
    fail_start: AtomicBool,
    start_count: AtomicU32,
    stop_count: AtomicU32,
}

impl std::fmt::Debug for MockWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWatcher")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("filter", &*self.filter.lock())
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

impl MockWatcher {
    /// Create a stopped watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the watcher is started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The filter passed to the last successful start.
    pub fn filter(&self) -> AdvertisementFilter {
        *self.filter.lock()
    }

    /// Make `start` fail.
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    /// Number of registered callbacks.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Number of successful starts.
    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::Relaxed)
    }

    /// Number of stops.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::Relaxed)
    }

    /// Deliver an advertisement if the watcher is running and its filter matches.
    pub fn emit(&self, advertisement: ReceivedAdvertisement) {
        if !self.is_running() || !self.filter.lock().matches(&advertisement) {
            return;
        }
        let handlers: Vec<_> = self.handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(advertisement.clone());
        }
    }
}

#[async_trait]
impl AdvertisementWatcher for MockWatcher {
    fn add_received_handler(&self, handler: AdvertisementHandler) -> EventToken {
        let token = EventToken::next();
        self.handlers.lock().insert(token, handler);
        token
    }

    fn remove_received_handler(&self, token: EventToken) -> Result<()> {
        self.handlers
            .lock()
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| Error::invalid_argument(format!("unknown token {}", token.value())))
    }

    async fn start(&self, filter: AdvertisementFilter) -> Result<()> {
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(Error::platform(MOCK_FAILURE_CODE, "watcher start failed"));
        }
        *self.filter.lock() = filter;
        self.start_count.fetch_add(1, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }
}
