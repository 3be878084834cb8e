//! Connection lifecycle.
//!
//! The [`ConnectionManager`] owns the map from device address to
//! [`DeviceAgent`]. An agent is inserted only after the platform connected
//! and enumerated services, and is removed by [`ConnectionManager::clean_connection`],
//! which runs both for explicit disconnects and for disconnects reported by
//! the platform.
//!
//! Devices registered with [`ConnectionManager::auto_connect`] are
//! reconnected in the background after a platform-reported disconnect,
//! following the manager's [`ReconnectOptions`]. An explicit disconnect
//! cancels any pending reconnection.
//!
//! The map lock is synchronous so teardown can run directly inside a
//! platform callback on any thread. It is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use quickblue_types::{ConnectionState, DeviceAddress};

use crate::agent::DeviceAgent;
use crate::error::{Error, Result};
use crate::events::{ConnectorEvent, EventDispatcher};
use crate::platform::{BlePlatform, ConnectionStatus, ConnectionStatusHandler};
use crate::reconnect::ReconnectOptions;

/// Owns every live device connection.
pub struct ConnectionManager {
    platform: Arc<dyn BlePlatform>,
    agents: RwLock<HashMap<DeviceAddress, Arc<DeviceAgent>>>,
    events: EventDispatcher,
    runtime: Handle,
    reconnect: ReconnectOptions,
    /// Auto-connected devices, each with the token of its latest reconnect loop.
    auto_connect: Mutex<HashMap<DeviceAddress, CancellationToken>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("agents", &self.agents.read().len())
            .field("auto_connect", &self.auto_connect.lock().len())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager that reports through `events`.
    ///
    /// Reconnect loops are spawned on `runtime`.
    pub fn new(platform: Arc<dyn BlePlatform>, events: EventDispatcher, runtime: Handle) -> Self {
        Self {
            platform,
            agents: RwLock::new(HashMap::new()),
            events,
            runtime,
            reconnect: ReconnectOptions::default(),
            auto_connect: Mutex::new(HashMap::new()),
        }
    }

    /// Set the reconnection policy for auto-connected devices.
    #[must_use]
    pub fn with_reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    /// The outbound event dispatcher.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The platform this manager connects through.
    pub fn platform(&self) -> &Arc<dyn BlePlatform> {
        &self.platform
    }

    /// Look up the agent for a connected device.
    pub fn agent(&self, address: DeviceAddress) -> Option<Arc<DeviceAgent>> {
        self.agents.read().get(&address).cloned()
    }

    /// Whether a device has an agent.
    pub fn contains(&self, address: DeviceAddress) -> bool {
        self.agents.read().contains_key(&address)
    }

    /// Addresses of every connected device.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        self.agents.read().keys().copied().collect()
    }

    /// Whether a device is registered for automatic reconnection.
    pub fn is_auto_connect(&self, address: DeviceAddress) -> bool {
        self.auto_connect.lock().contains_key(&address)
    }

    /// Connect to a device.
    ///
    /// The outcome is reported only through events: `connected` on success,
    /// exactly one `disconnected` on any failure. Connecting to a device that
    /// already has an agent re-reports `connected`.
    #[tracing::instrument(level = "info", skip_all, fields(device_id = %address))]
    pub async fn connect(self: &Arc<Self>, address: DeviceAddress) {
        self.attempt(address, true).await;
    }

    /// Connect to a device and keep it connected.
    ///
    /// Behaves like [`connect`](Self::connect), and additionally schedules
    /// reconnection attempts whenever the link is lost without an explicit
    /// [`disconnect`](Self::disconnect), including when this first attempt
    /// fails. Reconnection attempts report `connected` on success and stay
    /// silent on failure.
    #[tracing::instrument(level = "info", skip_all, fields(device_id = %address))]
    pub async fn auto_connect(self: &Arc<Self>, address: DeviceAddress) {
        self.auto_connect.lock().entry(address).or_default();
        if !self.attempt(address, true).await {
            self.schedule_reconnect(address);
        }
    }

    /// Run one connection attempt. Returns whether the device ended up connected.
    async fn attempt(self: &Arc<Self>, address: DeviceAddress, report_failure: bool) -> bool {
        if let Some(agent) = self.agent(address) {
            debug!("Device {} already connected", address);
            agent.emit_if_live(
                &self.events,
                ConnectorEvent::connection_state(address, ConnectionState::Connected),
            );
            return true;
        }

        let agent = match self.establish(address).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                if report_failure {
                    self.emit_state(address, ConnectionState::Disconnected);
                }
                return false;
            }
        };

        // A disconnect that fired before insertion found nothing to tear down.
        if !agent.is_connected().await {
            info!("Device {} dropped the link while connecting", address);
            if self.clean_connection(address) && report_failure {
                self.emit_state(address, ConnectionState::Disconnected);
            }
            return false;
        }

        agent.emit_if_live(
            &self.events,
            ConnectorEvent::connection_state(address, ConnectionState::Connected),
        );
        info!("Connected to device: {}", address);
        true
    }

    /// Start a reconnect loop for an auto-connected device, replacing any
    /// loop already running for it.
    fn schedule_reconnect(self: &Arc<Self>, address: DeviceAddress) {
        let cancel = {
            let mut auto_connect = self.auto_connect.lock();
            let Some(current) = auto_connect.get_mut(&address) else {
                return;
            };
            current.cancel();
            *current = CancellationToken::new();
            current.clone()
        };

        let manager = Arc::downgrade(self);
        let options = self.reconnect.clone();
        debug!("Scheduling reconnection to {}", address);
        self.runtime.spawn(async move {
            let mut attempts = 0;
            while !options.exhausted(attempts) {
                let delay = options.delay_for_attempt(attempts);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if manager.contains(address) {
                    return;
                }

                attempts += 1;
                info!(attempt = attempts, "Reconnecting to {}", address);
                if manager.attempt(address, false).await {
                    // Disconnected explicitly while the attempt was in flight.
                    if !manager.is_auto_connect(address) {
                        manager.disconnect(address);
                    }
                    return;
                }
            }
            warn!(
                "Giving up reconnecting to {} after {} attempts",
                address, attempts
            );
        });
    }

    /// Resolve, validate and register a device. Inserts only on full success.
    async fn establish(self: &Arc<Self>, address: DeviceAddress) -> Result<Arc<DeviceAgent>> {
        let device = self
            .platform
            .device_from_address(address)
            .await?
            .ok_or_else(|| Error::unknown_device(address))?;

        // Enumeration validates the link; an empty list is fine, a failure is not.
        if let Err(e) = device.gatt_services().await {
            device.close();
            return Err(e);
        }

        let token = match device
            .add_connection_status_handler(self.status_handler())
            .await
        {
            Ok(token) => token,
            Err(e) => {
                device.close();
                return Err(e);
            }
        };

        let agent = Arc::new(DeviceAgent::new(address, device.clone(), token));
        let winner = {
            let mut agents = self.agents.write();
            match agents.get(&address) {
                Some(existing) => Some(existing.clone()),
                None => {
                    agents.insert(address, agent.clone());
                    None
                }
            }
        };

        match winner {
            Some(existing) => {
                debug!(
                    "Another task connected {} while we were connecting, discarding our connection",
                    address
                );
                agent.discard();
                Ok(existing)
            }
            None => Ok(agent),
        }
    }

    fn status_handler(self: &Arc<Self>) -> ConnectionStatusHandler {
        let manager: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |address, status| {
            if let Some(manager) = manager.upgrade() {
                manager.on_connection_status_changed(address, status);
            }
        })
    }

    /// Handle a connection status change reported by the platform.
    ///
    /// Safe to call any number of times: only the call that actually tears
    /// the agent down emits `disconnected` and, for auto-connected devices,
    /// schedules reconnection.
    pub fn on_connection_status_changed(
        self: &Arc<Self>,
        address: DeviceAddress,
        status: ConnectionStatus,
    ) {
        match status {
            ConnectionStatus::Disconnected => {
                info!("Platform reported {} disconnected", address);
                if self.clean_connection(address) {
                    self.emit_state(address, ConnectionState::Disconnected);
                    self.schedule_reconnect(address);
                }
            }
            ConnectionStatus::Connected => {
                debug!("Platform reported {} connected", address);
            }
        }
    }

    /// Disconnect a device and cancel its automatic reconnection. Unknown
    /// addresses are a no-op.
    #[tracing::instrument(level = "info", skip_all, fields(device_id = %address))]
    pub fn disconnect(&self, address: DeviceAddress) {
        if let Some(cancel) = self.auto_connect.lock().remove(&address) {
            debug!("Cancelling automatic reconnection to {}", address);
            cancel.cancel();
        }
        if self.clean_connection(address) {
            self.emit_state(address, ConnectionState::Disconnected);
        }
    }

    /// Tear down the agent for `address`.
    ///
    /// Removes it from the map first, so concurrent lookups see "not found",
    /// then unregisters callbacks, clears caches and releases the handle.
    /// Returns whether an agent was torn down.
    pub fn clean_connection(&self, address: DeviceAddress) -> bool {
        let Some(agent) = self.agents.write().remove(&address) else {
            debug!("No connection to clean for {}", address);
            return false;
        };
        agent.shutdown();
        info!("Cleaned connection to {}", address);
        true
    }

    /// Tear down every connection and cancel every automatic reconnection.
    pub fn disconnect_all(&self) {
        for (_, cancel) in self.auto_connect.lock().drain() {
            cancel.cancel();
        }
        for address in self.addresses() {
            self.disconnect(address);
        }
    }

    fn emit_state(&self, address: DeviceAddress, state: ConnectionState) {
        self.events
            .send(ConnectorEvent::connection_state(address, state));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for (_, cancel) in self.auto_connect.get_mut().drain() {
            cancel.cancel();
        }
        let agents: Vec<_> = self.agents.get_mut().drain().map(|(_, agent)| agent).collect();
        for agent in agents {
            agent.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockCharacteristic, MockDevice, MockPlatform, MockService};

    const SVC: &str = "0000180f-0000-1000-8000-00805f9b34fb";
    const CHR: &str = "00002a19-0000-1000-8000-00805f9b34fb";

    fn address(value: u64) -> DeviceAddress {
        DeviceAddress::new(value).unwrap()
    }

    fn setup(value: u64) -> (Arc<MockPlatform>, Arc<MockDevice>, Arc<ConnectionManager>) {
        let platform = Arc::new(MockPlatform::new());
        let device = MockDevice::builder(value)
            .service(MockService::new(SVC).with_characteristic(MockCharacteristic::new(CHR)))
            .build();
        platform.add_device(device.clone());
        let manager = Arc::new(ConnectionManager::new(
            platform.clone(),
            EventDispatcher::new(32),
            Handle::current(),
        ));
        (platform, device, manager)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ConnectorEvent>) -> Vec<ConnectorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn state(value: u64, state: ConnectionState) -> ConnectorEvent {
        ConnectorEvent::connection_state(address(value), state)
    }

    #[tokio::test]
    async fn test_connect_inserts_agent() {
        let (_platform, device, manager) = setup(42);
        let mut rx = manager.events().subscribe();

        manager.connect(address(42)).await;

        assert!(manager.contains(address(42)));
        assert_eq!(device.connection_handler_count(), 1);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Connected)]);
    }

    #[tokio::test]
    async fn test_enumeration_failure_emits_single_disconnect() {
        let (_platform, device, manager) = setup(42);
        device.fail_service_enumeration(true);
        let mut rx = manager.events().subscribe();

        manager.connect(address(42)).await;

        assert!(!manager.contains(address(42)));
        assert_eq!(device.connection_handler_count(), 0);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Disconnected)]);
    }

    #[tokio::test]
    async fn test_unknown_and_failing_lookups_emit_disconnect() {
        let (platform, _device, manager) = setup(42);
        let mut rx = manager.events().subscribe();

        manager.connect(address(9)).await;
        platform.fail_lookup(true);
        manager.connect(address(42)).await;

        assert!(manager.addresses().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![
                state(9, ConnectionState::Disconnected),
                state(42, ConnectionState::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnect_reuses_agent() {
        let (_platform, device, manager) = setup(42);
        manager.connect(address(42)).await;
        let first = manager.agent(address(42)).unwrap();
        let mut rx = manager.events().subscribe();

        manager.connect(address(42)).await;

        assert!(Arc::ptr_eq(&first, &manager.agent(address(42)).unwrap()));
        assert_eq!(device.service_enumerations(), 1);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Connected)]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (_platform, device, manager) = setup(42);
        manager.connect(address(42)).await;
        let mut rx = manager.events().subscribe();

        manager.disconnect(address(42));
        manager.disconnect(address(42));

        assert!(!manager.contains(address(42)));
        assert_eq!(device.connection_handler_count(), 0);
        assert_eq!(device.close_count(), 1);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Disconnected)]);
    }

    #[tokio::test]
    async fn test_platform_disconnect_after_explicit_disconnect_is_noop() {
        let (_platform, device, manager) = setup(42);
        manager.connect(address(42)).await;
        let mut rx = manager.events().subscribe();

        manager.disconnect(address(42));
        manager.on_connection_status_changed(address(42), ConnectionStatus::Disconnected);
        device.simulate_disconnect();

        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Disconnected)]);
    }

    #[tokio::test]
    async fn test_platform_disconnect_tears_down() {
        let (_platform, device, manager) = setup(7);
        manager.connect(address(7)).await;
        let agent = manager.agent(address(7)).unwrap();
        let mut rx = manager.events().subscribe();

        device.simulate_disconnect();

        assert!(!manager.contains(address(7)));
        assert!(!agent.holds_handle());
        assert_eq!(device.connection_handler_count(), 0);
        assert_eq!(drain(&mut rx), vec![state(7, ConnectionState::Disconnected)]);
    }

    #[tokio::test]
    async fn test_connected_status_does_not_mutate_map() {
        let (_platform, device, manager) = setup(7);
        manager.connect(address(7)).await;

        device.notify_status(ConnectionStatus::Connected);

        assert!(manager.contains(address(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_keep_one_agent() {
        let (_platform, device, manager) = setup(42);
        device.set_enumeration_latency(Duration::from_millis(50));
        let mut rx = manager.events().subscribe();

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(address(42)).await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(address(42)).await }
        });
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(manager.addresses(), vec![address(42)]);
        assert_eq!(device.connection_handler_count(), 1);
        assert_eq!(device.close_count(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                state(42, ConnectionState::Connected),
                state(42, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_reconnects_after_platform_disconnect() {
        let (_platform, device, manager) = setup(42);
        manager.auto_connect(address(42)).await;
        assert!(manager.is_auto_connect(address(42)));
        let mut rx = manager.events().subscribe();

        device.simulate_disconnect();
        assert!(!manager.contains(address(42)));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(manager.contains(address(42)));
        assert!(device.is_connected_sync());
        assert_eq!(device.service_enumerations(), 2);
        assert_eq!(
            drain(&mut rx),
            vec![
                state(42, ConnectionState::Disconnected),
                state(42, ConnectionState::Connected),
            ]
        );

        // The new agent keeps the device auto-connected.
        device.simulate_disconnect();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.contains(address(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_cancels_reconnection() {
        let (_platform, device, manager) = setup(42);
        manager.auto_connect(address(42)).await;
        let mut rx = manager.events().subscribe();

        device.simulate_disconnect();
        manager.disconnect(address(42));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!manager.contains(address(42)));
        assert!(!manager.is_auto_connect(address(42)));
        assert_eq!(device.service_enumerations(), 1);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Disconnected)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_is_not_reconnected() {
        let (_platform, device, manager) = setup(42);
        manager.auto_connect(address(42)).await;

        manager.disconnect(address(42));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!manager.contains(address(42)));
        assert_eq!(device.service_enumerations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_connect_is_not_reconnected() {
        let (_platform, device, manager) = setup(42);
        manager.connect(address(42)).await;

        device.simulate_disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!manager.contains(address(42)));
        assert!(!manager.is_auto_connect(address(42)));
        assert_eq!(device.service_enumerations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_gives_up_silently() {
        let (platform, device, _) = setup(42);
        let options = ReconnectOptions::fixed_delay(Duration::from_secs(1)).max_attempts(2);
        let manager = Arc::new(
            ConnectionManager::new(platform, EventDispatcher::new(32), Handle::current())
                .with_reconnect(options),
        );
        manager.auto_connect(address(42)).await;
        let mut rx = manager.events().subscribe();

        device.fail_service_enumeration(true);
        device.simulate_disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;
        device.fail_service_enumeration(false);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!manager.contains(address(42)));
        assert_eq!(device.service_enumerations(), 3);
        assert_eq!(drain(&mut rx), vec![state(42, ConnectionState::Disconnected)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_connect_retries_failed_first_attempt() {
        let (_platform, device, manager) = setup(42);
        device.fail_service_enumeration(true);
        let mut rx = manager.events().subscribe();

        manager.auto_connect(address(42)).await;
        assert!(!manager.contains(address(42)));
        device.fail_service_enumeration(false);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(manager.contains(address(42)));
        assert_eq!(
            drain(&mut rx),
            vec![
                state(42, ConnectionState::Disconnected),
                state(42, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_cancels_reconnection() {
        let (_platform, device, manager) = setup(42);
        manager.auto_connect(address(42)).await;

        device.simulate_disconnect();
        manager.disconnect_all();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(!manager.contains(address(42)));
        assert!(!manager.is_auto_connect(address(42)));
        assert_eq!(device.service_enumerations(), 1);
    }
}
