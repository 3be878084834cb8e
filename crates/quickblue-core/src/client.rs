//! The request-facing facade.
//!
//! [`QuickBlue`] accepts one call per operation, validates it, and returns
//! as soon as the work is scheduled. `Ok(())` means "accepted", not
//! "completed": outcomes arrive on the event streams.
//!
//! Requests naming a device that is not connected are rejected with
//! [`Error::UnknownDevice`] before anything is spawned. `connect`,
//! `autoConnect` and `disconnect` are the exceptions, since they operate on
//! the connection map itself.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use quickblue_types::codec::to_buffer;
use quickblue_types::uuids::{is_canonical, normalize_uuid, parse_uuid};
use quickblue_types::{DeviceAddress, NotifyMode, WriteMode};

use crate::agent::DeviceAgent;
use crate::btle::BtleplugPlatform;
use crate::config::QuickBlueConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, ScanReceiver};
use crate::gatt::GattOrchestrator;
use crate::manager::ConnectionManager;
use crate::method::MethodCall;
use crate::platform::{AdvertisementFilter, BlePlatform, RadioState};
use crate::scan::ScanWatcher;

/// A BLE bridge bound to one platform and one tokio runtime.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use quickblue_core::mock::{MockDevice, MockPlatform};
/// use quickblue_core::{QuickBlue, QuickBlueConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> quickblue_core::Result<()> {
/// let platform = Arc::new(MockPlatform::new());
/// platform.add_device(MockDevice::builder(42).build());
///
/// let bridge = QuickBlue::new(platform, QuickBlueConfig::default())?;
/// let mut events = bridge.subscribe();
/// bridge.connect("42".parse()?)?;
/// println!("{:?}", events.recv().await);
/// # Ok(())
/// # }
/// ```
pub struct QuickBlue {
    platform: Arc<dyn BlePlatform>,
    manager: Arc<ConnectionManager>,
    gatt: GattOrchestrator,
    scanner: ScanWatcher,
    runtime: Handle,
}

impl std::fmt::Debug for QuickBlue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickBlue")
            .field("manager", &self.manager)
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl QuickBlue {
    /// Create a bridge over `platform`.
    ///
    /// Must be called from inside a tokio runtime; spawned operations run on
    /// that runtime. Fails with [`Error::InvalidConfig`] if `config` does not
    /// validate.
    pub fn new(platform: Arc<dyn BlePlatform>, config: QuickBlueConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        config.validate()?;
        let manager = Arc::new(
            ConnectionManager::new(
                platform.clone(),
                EventDispatcher::new(config.event_capacity),
                runtime.clone(),
            )
            .with_reconnect(config.reconnect),
        );
        let scanner = ScanWatcher::new(
            platform.clone(),
            EventDispatcher::new(config.scan_capacity),
            runtime.clone(),
        );
        Ok(Self {
            gatt: GattOrchestrator::new(manager.clone()),
            platform,
            manager,
            scanner,
            runtime,
        })
    }

    /// Create a bridge over the first btleplug adapter.
    pub async fn btleplug(config: QuickBlueConfig) -> Result<Self> {
        let platform = BtleplugPlatform::new().await?;
        Self::new(Arc::new(platform), config)
    }

    /// Subscribe to connector events.
    pub fn subscribe(&self) -> EventReceiver {
        self.manager.events().subscribe()
    }

    /// Subscribe to scan results.
    pub fn subscribe_scan_results(&self) -> ScanReceiver {
        self.scanner.subscribe()
    }

    /// The connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The GATT orchestrator.
    pub fn gatt(&self) -> &GattOrchestrator {
        &self.gatt
    }

    /// Whether a radio is present and powered on. Lookup failures read as `false`.
    pub async fn is_available(&self) -> bool {
        match self.platform.radio_state().await {
            Ok(state) => state == RadioState::On,
            Err(e) => {
                warn!("Failed to query radio state: {}", e);
                false
            }
        }
    }

    /// Start forwarding advertisements.
    ///
    /// With a `service_id`, only advertisements listing that service are
    /// forwarded. Calling again while scanning replaces the filter.
    pub async fn start_scan(&self, service_id: Option<&str>) -> Result<()> {
        let filter = match service_id {
            Some(id) => AdvertisementFilter::service(
                parse_uuid(id).map_err(|e| Error::invalid_argument(format!("service id: {e}")))?,
            ),
            None => AdvertisementFilter::any(),
        };
        self.scanner.start_scan(filter).await
    }

    /// Stop forwarding advertisements.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Schedule a connection. The outcome arrives as a `connection_state` event.
    pub fn connect(&self, device_id: DeviceAddress) -> Result<()> {
        debug!("connect {}", device_id);
        let manager = self.manager.clone();
        self.runtime
            .spawn(async move { manager.connect(device_id).await });
        Ok(())
    }

    /// Schedule a connection that is re-established whenever the platform
    /// drops the link, until [`disconnect`](Self::disconnect).
    pub fn auto_connect(&self, device_id: DeviceAddress) -> Result<()> {
        debug!("autoConnect {}", device_id);
        let manager = self.manager.clone();
        self.runtime
            .spawn(async move { manager.auto_connect(device_id).await });
        Ok(())
    }

    /// Tear down a connection and cancel its automatic reconnection.
    /// Unknown devices are a no-op.
    pub fn disconnect(&self, device_id: DeviceAddress) -> Result<()> {
        debug!("disconnect {}", device_id);
        self.manager.disconnect(device_id);
        Ok(())
    }

    /// Schedule service discovery.
    pub fn discover_services(&self, device_id: DeviceAddress) -> Result<()> {
        debug!("discoverServices {}", device_id);
        let agent = self.agent(device_id)?;
        let gatt = self.gatt.clone();
        self.runtime
            .spawn(async move { gatt.discover_services(agent).await });
        Ok(())
    }

    /// Schedule a subscription change.
    ///
    /// Changes for the same characteristic are applied in call order.
    pub fn set_notifiable(
        &self,
        device_id: DeviceAddress,
        service_id: &str,
        characteristic_id: &str,
        mode: NotifyMode,
    ) -> Result<()> {
        let service_id = attribute_id("service", service_id)?;
        let characteristic_id = attribute_id("characteristic", characteristic_id)?;
        debug!(
            "setNotifiable {} {}/{} {:?}",
            device_id, service_id, characteristic_id, mode
        );
        let agent = self.agent(device_id)?;

        let turn = agent.enqueue_subscription(&characteristic_id);
        let gatt = self.gatt.clone();
        self.runtime.spawn(async move {
            gatt.set_notifiable(agent, &service_id, &characteristic_id, mode, turn)
                .await
        });
        Ok(())
    }

    /// Schedule an MTU negotiation.
    pub fn request_mtu(&self, device_id: DeviceAddress, expected_mtu: u16) -> Result<()> {
        debug!("requestMtu {} {}", device_id, expected_mtu);
        let agent = self.agent(device_id)?;
        let gatt = self.gatt.clone();
        self.runtime
            .spawn(async move { gatt.request_mtu(agent, expected_mtu).await });
        Ok(())
    }

    /// Schedule a characteristic read.
    pub fn read_value(
        &self,
        device_id: DeviceAddress,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<()> {
        let service_id = attribute_id("service", service_id)?;
        let characteristic_id = attribute_id("characteristic", characteristic_id)?;
        debug!("readValue {} {}/{}", device_id, service_id, characteristic_id);
        let agent = self.agent(device_id)?;

        let gatt = self.gatt.clone();
        self.runtime.spawn(async move {
            gatt.read_value(agent, &service_id, &characteristic_id)
                .await
        });
        Ok(())
    }

    /// Schedule a characteristic write.
    ///
    /// `value` is copied before this returns, so the caller may reuse it.
    pub fn write_value(
        &self,
        device_id: DeviceAddress,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let service_id = attribute_id("service", service_id)?;
        let characteristic_id = attribute_id("characteristic", characteristic_id)?;
        debug!(
            "writeValue {} {}/{} ({} bytes, {:?})",
            device_id,
            service_id,
            characteristic_id,
            value.len(),
            mode
        );
        let agent = self.agent(device_id)?;

        let value = to_buffer(value);
        let gatt = self.gatt.clone();
        self.runtime.spawn(async move {
            gatt.write_value(agent, &service_id, &characteristic_id, value, mode)
                .await
        });
        Ok(())
    }

    /// Schedule an RSSI read.
    pub fn read_rssi(&self, device_id: DeviceAddress) -> Result<()> {
        debug!("readRssi {}", device_id);
        let agent = self.agent(device_id)?;
        let gatt = self.gatt.clone();
        self.runtime
            .spawn(async move { gatt.read_rssi(agent).await });
        Ok(())
    }

    /// Dispatch a decoded method call.
    ///
    /// Returns `Bool` for availability and `Null` for everything else.
    pub async fn handle_method_call(&self, call: MethodCall) -> Result<serde_json::Value> {
        match call {
            MethodCall::IsAvailable => {
                return Ok(serde_json::Value::Bool(self.is_available().await));
            }
            MethodCall::StartScan { service_id } => self.start_scan(service_id.as_deref()).await?,
            MethodCall::StopScan => self.stop_scan().await?,
            MethodCall::Connect { device_id } => self.connect(device_id)?,
            MethodCall::AutoConnect { device_id } => self.auto_connect(device_id)?,
            MethodCall::Disconnect { device_id } => self.disconnect(device_id)?,
            MethodCall::DiscoverServices { device_id } => self.discover_services(device_id)?,
            MethodCall::SetNotifiable {
                device_id,
                service_id,
                characteristic_id,
                mode,
            } => self.set_notifiable(device_id, &service_id, &characteristic_id, mode)?,
            MethodCall::RequestMtu {
                device_id,
                expected_mtu,
            } => self.request_mtu(device_id, expected_mtu)?,
            MethodCall::ReadValue {
                device_id,
                service_id,
                characteristic_id,
            } => self.read_value(device_id, &service_id, &characteristic_id)?,
            MethodCall::WriteValue {
                device_id,
                service_id,
                characteristic_id,
                bytes,
                mode,
            } => self.write_value(device_id, &service_id, &characteristic_id, &bytes, mode)?,
            MethodCall::ReadRssi { device_id } => self.read_rssi(device_id)?,
        }
        Ok(serde_json::Value::Null)
    }

    /// Stop scanning and tear down every connection.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }
        self.manager.disconnect_all();
    }

    fn agent(&self, device_id: DeviceAddress) -> Result<Arc<DeviceAgent>> {
        self.manager
            .agent(device_id)
            .ok_or_else(|| Error::unknown_device(device_id))
    }
}

fn attribute_id(kind: &str, id: &str) -> Result<String> {
    if is_canonical(id) {
        return Ok(id.to_string());
    }
    normalize_uuid(id).map_err(|e| Error::invalid_argument(format!("{kind} id: {e}")))
}
