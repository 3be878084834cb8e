//! Platform implementation over btleplug.
//!
//! Devices are looked up among the peripherals the adapter has already
//! seen, so a device must have been observed by a scan before it can be
//! connected. Connection status and value changes are pumped from
//! btleplug's event streams into the registered handlers by spawned tasks;
//! each registration token owns one task and removing the token aborts it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quickblue_types::{DescriptorValue, DeviceAddress, WriteMode};

use crate::error::{Error, Result};
use crate::platform::{
    AdvertisementFilter, AdvertisementHandler, AdvertisementWatcher, BleDevice, BlePlatform,
    CharacteristicHandle, ConnectionStatus, ConnectionStatusHandler, DeviceHandle, EventToken,
    GattCharacteristic, GattService, ManufacturerData, RadioState, ReceivedAdvertisement,
    ServiceHandle, ValueChanged, ValueChangedHandler, WatcherHandle,
};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

fn address_of(peripheral: &Peripheral) -> DeviceAddress {
    DeviceAddress::from_mac_bytes(peripheral.address().into_inner())
}

/// Listener tasks keyed by the token handed out for them.
#[derive(Default)]
struct Listeners {
    tasks: Mutex<HashMap<EventToken, JoinHandle<()>>>,
}

impl Listeners {
    fn insert(&self, task: JoinHandle<()>) -> EventToken {
        let token = EventToken::next();
        self.tasks.lock().insert(token, task);
        token
    }

    fn remove(&self, token: EventToken) -> Result<()> {
        match self.tasks.lock().remove(&token) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(Error::invalid_argument(format!(
                "unknown token {}",
                token.value()
            ))),
        }
    }

    fn abort_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// btleplug-backed [`BlePlatform`].
pub struct BtleplugPlatform {
    adapter: Adapter,
    runtime: Handle,
}

impl std::fmt::Debug for BtleplugPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugPlatform").finish_non_exhaustive()
    }
}

impl BtleplugPlatform {
    /// Use the first available adapter.
    pub async fn new() -> Result<Self> {
        Self::with_adapter(get_adapter().await?)
    }

    /// Use a specific adapter. Must be called inside a tokio runtime.
    pub fn with_adapter(adapter: Adapter) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self { adapter, runtime })
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(match self.adapter.adapter_state().await? {
            CentralState::PoweredOn => RadioState::On,
            CentralState::PoweredOff => RadioState::Off,
            _ => RadioState::Unknown,
        })
    }

    async fn device_from_address(&self, address: DeviceAddress) -> Result<Option<DeviceHandle>> {
        let peripherals = self.adapter.peripherals().await?;
        let device = peripherals
            .into_iter()
            .find(|peripheral| address_of(peripheral) == address)
            .map(|peripheral| {
                Arc::new(BtleDevice::new(
                    self.adapter.clone(),
                    peripheral,
                    self.runtime.clone(),
                )) as DeviceHandle
            });
        if device.is_none() {
            debug!("No peripheral with address {} has been seen", address);
        }
        Ok(device)
    }

    fn advertisement_watcher(&self) -> Result<WatcherHandle> {
        Ok(Arc::new(BtleWatcher::new(
            self.adapter.clone(),
            self.runtime.clone(),
        )))
    }
}

/// btleplug-backed [`BleDevice`].
pub struct BtleDevice {
    adapter: Adapter,
    peripheral: Peripheral,
    address: DeviceAddress,
    runtime: Handle,
    status_listeners: Listeners,
}

impl std::fmt::Debug for BtleDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleDevice")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BtleDevice {
    fn new(adapter: Adapter, peripheral: Peripheral, runtime: Handle) -> Self {
        Self {
            address: address_of(&peripheral),
            adapter,
            peripheral,
            runtime,
            status_listeners: Listeners::default(),
        }
    }

    async fn properties(&self) -> Result<Option<PeripheralProperties>> {
        Ok(self.peripheral.properties().await?)
    }
}

#[async_trait]
impl BleDevice for BtleDevice {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    async fn name(&self) -> Result<Option<String>> {
        Ok(self.properties().await?.and_then(|p| p.local_name))
    }

    async fn connection_status(&self) -> ConnectionStatus {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    async fn gatt_services(&self) -> Result<Vec<ServiceHandle>> {
        if !self.peripheral.is_connected().await? {
            info!("Connecting to peripheral {}", self.address);
            self.peripheral.connect().await?;
        }
        self.peripheral.discover_services().await?;

        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                Arc::new(BtleService {
                    peripheral: self.peripheral.clone(),
                    service,
                    address: self.address,
                    runtime: self.runtime.clone(),
                }) as ServiceHandle
            })
            .collect())
    }

    async fn add_connection_status_handler(
        &self,
        handler: ConnectionStatusHandler,
    ) -> Result<EventToken> {
        let mut events = self.adapter.events().await?;
        let id: PeripheralId = self.peripheral.id();
        let address = self.address;

        let task = self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceConnected(peer) if peer == id => {
                        handler(address, ConnectionStatus::Connected);
                    }
                    CentralEvent::DeviceDisconnected(peer) if peer == id => {
                        handler(address, ConnectionStatus::Disconnected);
                    }
                    _ => {}
                }
            }
        });
        Ok(self.status_listeners.insert(task))
    }

    fn remove_connection_status_handler(&self, token: EventToken) -> Result<()> {
        self.status_listeners.remove(token)
    }

    async fn negotiate_mtu(&self, _expected: u16) -> Result<u16> {
        Err(Error::not_supported("MTU negotiation"))
    }

    async fn rssi(&self) -> Result<i16> {
        self.properties()
            .await?
            .and_then(|p| p.rssi)
            .ok_or_else(|| Error::not_supported("RSSI unavailable"))
    }

    fn close(&self) {
        self.status_listeners.abort_all();

        let peripheral = self.peripheral.clone();
        let address = self.address;
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!(
                    device_address = %address,
                    error = %e,
                    "Best-effort disconnect failed (device may already be disconnected)"
                );
            }
        });
    }
}

/// btleplug-backed [`GattService`].
struct BtleService {
    peripheral: Peripheral,
    service: Service,
    address: DeviceAddress,
    runtime: Handle,
}

#[async_trait]
impl GattService for BtleService {
    fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    fn is_valid(&self) -> bool {
        self.peripheral
            .services()
            .iter()
            .any(|service| service.uuid == self.service.uuid)
    }

    async fn characteristics(&self) -> Result<Vec<CharacteristicHandle>> {
        Ok(self
            .service
            .characteristics
            .iter()
            .map(|characteristic| {
                Arc::new(BtleCharacteristic {
                    peripheral: self.peripheral.clone(),
                    characteristic: characteristic.clone(),
                    address: self.address,
                    runtime: self.runtime.clone(),
                    listeners: Arc::new(Listeners::default()),
                }) as CharacteristicHandle
            })
            .collect())
    }
}

/// btleplug-backed [`GattCharacteristic`].
#[derive(Clone)]
struct BtleCharacteristic {
    peripheral: Peripheral,
    characteristic: Characteristic,
    address: DeviceAddress,
    runtime: Handle,
    listeners: Arc<Listeners>,
}

#[async_trait]
impl GattCharacteristic for BtleCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }

    fn service_uuid(&self) -> Option<Uuid> {
        Some(self.characteristic.service_uuid)
    }

    fn device_address(&self) -> Option<DeviceAddress> {
        Some(self.address)
    }

    fn is_valid(&self) -> bool {
        self.peripheral.characteristics().contains(&self.characteristic)
    }

    async fn read_value(&self) -> Result<Bytes> {
        let value = self.peripheral.read(&self.characteristic).await?;
        Ok(Bytes::from(value))
    }

    async fn write_value(&self, value: Bytes, mode: WriteMode) -> Result<()> {
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&self.characteristic, &value, write_type)
            .await?;
        Ok(())
    }

    async fn write_client_configuration(&self, value: DescriptorValue) -> Result<()> {
        // btleplug chooses notify or indicate from the characteristic properties.
        match value {
            DescriptorValue::None => self.peripheral.unsubscribe(&self.characteristic).await?,
            DescriptorValue::Notify | DescriptorValue::Indicate => {
                self.peripheral.subscribe(&self.characteristic).await?
            }
        }
        Ok(())
    }

    async fn add_value_changed_handler(&self, handler: ValueChangedHandler) -> Result<EventToken> {
        let stream = self.peripheral.notifications().await?;
        let source: CharacteristicHandle = Arc::new(self.clone());
        let task = pump_notifications(
            &self.runtime,
            stream,
            self.characteristic.uuid,
            source,
            handler,
        );
        Ok(self.listeners.insert(task))
    }

    fn remove_value_changed_handler(&self, token: EventToken) -> Result<()> {
        self.listeners.remove(token)
    }
}

/// Forward notifications for `uuid` to `handler` on `runtime`.
///
/// Registration may be called from a thread outside the runtime, so the task
/// is spawned on the stored handle rather than the ambient one.
fn pump_notifications<S>(
    runtime: &Handle,
    mut stream: S,
    uuid: Uuid,
    source: CharacteristicHandle,
    handler: ValueChangedHandler,
) -> JoinHandle<()>
where
    S: Stream<Item = ValueNotification> + Send + Unpin + 'static,
{
    runtime.spawn(async move {
        while let Some(notification) = stream.next().await {
            if notification.uuid == uuid {
                handler(ValueChanged {
                    characteristic: Some(source.clone()),
                    value: Some(Bytes::from(notification.value)),
                });
            }
        }
    })
}

/// btleplug-backed [`AdvertisementWatcher`].
///
/// Reports one advertisement per discovery or update event from the
/// adapter. Manufacturer data is ordered by company identifier. The RSSI is
/// 0 when the adapter did not report one.
///
/// A service filter is passed to the adapter and also checked against the
/// advertised services, since some backends ignore it.
pub struct BtleWatcher {
    adapter: Adapter,
    runtime: Handle,
    handlers: Arc<Mutex<HashMap<EventToken, AdvertisementHandler>>>,
    running: Mutex<Option<RunningScan>>,
}

struct RunningScan {
    cancel: CancellationToken,
    filter: AdvertisementFilter,
}

impl std::fmt::Debug for BtleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleWatcher")
            .field("handlers", &self.handlers.lock().len())
            .field(
                "filter",
                &self.running.lock().as_ref().map(|running| running.filter),
            )
            .finish()
    }
}

impl BtleWatcher {
    fn new(adapter: Adapter, runtime: Handle) -> Self {
        Self {
            adapter,
            runtime,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }
}

/// Convert adapter properties into an advertisement.
fn advertisement_from(properties: PeripheralProperties) -> ReceivedAdvertisement {
    let mut manufacturer_data: Vec<_> = properties
        .manufacturer_data
        .into_iter()
        .map(|(company_id, data)| ManufacturerData { company_id, data })
        .collect();
    manufacturer_data.sort_by_key(|element| element.company_id);

    ReceivedAdvertisement {
        address: DeviceAddress::from_mac_bytes(properties.address.into_inner()),
        local_name: properties.local_name,
        manufacturer_data,
        services: properties.services,
        rssi: properties.rssi.unwrap_or_default(),
    }
}

#[async_trait]
impl AdvertisementWatcher for BtleWatcher {
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
        let previous = {
            let mut running = self.running.lock();
            match running.as_ref() {
                Some(current) if current.filter == filter => return Ok(()),
                Some(_) => running.take(),
                None => None,
            }
        };
        if let Some(previous) = previous {
            debug!("Restarting scan with service filter {:?}", filter.service);
            previous.cancel.cancel();
            self.adapter.stop_scan().await?;
        }

        let mut events = self.adapter.events().await?;
        let scan_filter = ScanFilter {
            services: filter.service.into_iter().collect(),
        };
        self.adapter.start_scan(scan_filter).await?;

        let cancel = CancellationToken::new();
        let running = RunningScan {
            cancel: cancel.clone(),
            filter,
        };
        if let Some(previous) = self.running.lock().replace(running) {
            previous.cancel.cancel();
        }

        let adapter = self.adapter.clone();
        let handlers = self.handlers.clone();
        self.runtime.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let properties = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral.properties().await,
                    Err(e) => Err(e),
                };
                let properties = match properties {
                    Ok(Some(properties)) => properties,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Failed to read advertisement properties: {}", e);
                        continue;
                    }
                };

                let advertisement = advertisement_from(properties);
                if !filter.matches(&advertisement) {
                    continue;
                }
                let snapshot: Vec<_> = handlers.lock().values().cloned().collect();
                for handler in snapshot {
                    handler(advertisement.clone());
                }
            }
            debug!("Advertisement pump stopped");
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        running.cancel.cancel();
        self.adapter.stop_scan().await?;
        Ok(())
    }
}
