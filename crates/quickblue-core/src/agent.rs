//! Per-device connection state.
//!
//! A [`DeviceAgent`] owns the live handle of one connected device together
//! with its service cache, characteristic cache and active notification
//! registrations. Lookups are cache-first and self-healing: a cached handle
//! that reports itself invalid is evicted and fetched again.
//!
//! Locks in this module are synchronous and never held across an `.await`
//! or a call into the platform, except for the handle read-lock that gates
//! event delivery and cache insertion. Teardown takes that lock for writing,
//! which orders it against every in-flight delivery.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use quickblue_types::DeviceAddress;
use quickblue_types::uuids::format_uuid;

use crate::events::{ConnectorEvent, EventDispatcher};
use crate::platform::{
    CharacteristicHandle, ConnectionStatus, DeviceHandle, EventToken, ServiceHandle,
};

/// An active value-changed registration for one characteristic.
#[derive(Clone)]
struct NotificationRegistration {
    characteristic: CharacteristicHandle,
    token: EventToken,
}

/// A place in the per-characteristic subscription queue.
///
/// Dropping the turn lets the next queued request for the same
/// characteristic proceed.
pub struct SubscriptionTurn {
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl SubscriptionTurn {
    /// Wait until every earlier request for this characteristic has finished.
    pub async fn wait(&mut self) {
        if let Some(previous) = self.previous.take() {
            // A dropped sender is the completion signal.
            let _ = previous.await;
        }
    }
}

/// State for one connected device.
pub struct DeviceAgent {
    address: DeviceAddress,
    handle: RwLock<Option<DeviceHandle>>,
    closing: AtomicBool,
    connection_token: Mutex<Option<EventToken>>,
    services: Mutex<HashMap<String, ServiceHandle>>,
    characteristics: Mutex<HashMap<String, CharacteristicHandle>>,
    notifications: Mutex<HashMap<String, NotificationRegistration>>,
    subscription_tails: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl fmt::Debug for DeviceAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAgent")
            .field("address", &self.address)
            .field("live", &self.is_live())
            .field("services", &self.services.lock().len())
            .field("characteristics", &self.characteristics.lock().len())
            .field("notifications", &self.notifications.lock().len())
            .finish()
    }
}

impl DeviceAgent {
    /// Create an agent for a device whose link was just validated.
    pub(crate) fn new(
        address: DeviceAddress,
        device: DeviceHandle,
        connection_token: EventToken,
    ) -> Self {
        Self {
            address,
            handle: RwLock::new(Some(device)),
            closing: AtomicBool::new(false),
            connection_token: Mutex::new(Some(connection_token)),
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            subscription_tails: Mutex::new(HashMap::new()),
        }
    }

    /// The device address. Remains available after teardown.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Borrow the live device handle for one operation.
    ///
    /// Returns `None` once teardown has started.
    pub fn device(&self) -> Option<DeviceHandle> {
        let handle = self.handle.read();
        if self.closing.load(Ordering::Acquire) {
            return None;
        }
        handle.clone()
    }

    fn is_live(&self) -> bool {
        !self.closing.load(Ordering::Acquire) && self.handle.read().is_some()
    }

    /// True iff the handle is present and the platform reports a connection.
    pub async fn is_connected(&self) -> bool {
        match self.device() {
            Some(device) => device.connection_status().await == ConnectionStatus::Connected,
            None => false,
        }
    }

    /// Look up a service, enumerating the device on a cache miss.
    pub async fn get_service(&self, service_id: &str) -> Option<ServiceHandle> {
        if let Some(service) = self.cached_service(service_id) {
            return Some(service);
        }

        let device = self.device()?;
        let services = match device.gatt_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!(device_id = %self.address, service_id, error = %e, "Service enumeration failed");
                return None;
            }
        };

        let service = services
            .into_iter()
            .find(|service| format_uuid(&service.uuid()) == service_id)?;
        self.cache_service(service_id, service.clone());
        Some(service)
    }

    /// Look up a characteristic by id, resolving its service on a cache miss.
    pub async fn get_characteristic(
        &self,
        service_id: &str,
        characteristic_id: &str,
    ) -> Option<CharacteristicHandle> {
        if let Some(characteristic) = self.cached_characteristic(characteristic_id) {
            return Some(characteristic);
        }

        let service = self.get_service(service_id).await?;
        let characteristics = match service.characteristics().await {
            Ok(characteristics) => characteristics,
            Err(e) => {
                warn!(
                    device_id = %self.address,
                    service_id,
                    characteristic_id,
                    error = %e,
                    "Characteristic enumeration failed"
                );
                return None;
            }
        };

        let characteristic = characteristics
            .into_iter()
            .find(|characteristic| format_uuid(&characteristic.uuid()) == characteristic_id)?;
        self.cache_characteristic(characteristic_id, characteristic.clone());
        Some(characteristic)
    }

    fn cached_service(&self, service_id: &str) -> Option<ServiceHandle> {
        let service = self.services.lock().get(service_id)?.clone();
        if service.is_valid() {
            return Some(service);
        }
        debug!(device_id = %self.address, service_id, "Evicting stale service");
        self.services.lock().remove(service_id);
        None
    }

    fn cached_characteristic(&self, characteristic_id: &str) -> Option<CharacteristicHandle> {
        let characteristic = self.characteristics.lock().get(characteristic_id)?.clone();
        if characteristic.is_valid() {
            return Some(characteristic);
        }

        debug!(device_id = %self.address, characteristic_id, "Evicting stale characteristic");
        self.characteristics.lock().remove(characteristic_id);
        // A registration must not outlive its cache entry.
        self.remove_notification(characteristic_id);
        None
    }

    /// Insert a service unless teardown has started. Last write wins.
    pub(crate) fn cache_service(&self, service_id: &str, service: ServiceHandle) {
        let _gate = self.handle.read();
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.services.lock().insert(service_id.to_string(), service);
    }

    /// Insert a characteristic unless teardown has started. Last write wins.
    pub(crate) fn cache_characteristic(
        &self,
        characteristic_id: &str,
        characteristic: CharacteristicHandle,
    ) {
        let _gate = self.handle.read();
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.characteristics
            .lock()
            .insert(characteristic_id.to_string(), characteristic);
    }

    /// Emit an event only while the device handle is live.
    ///
    /// Holds the handle read-lock while sending, so an event can never be
    /// sent after teardown has released the handle.
    pub fn emit_if_live(&self, events: &EventDispatcher, event: ConnectorEvent) -> bool {
        let handle = self.handle.read();
        if handle.is_none() || self.closing.load(Ordering::Acquire) {
            debug!(device_id = %self.address, ?event, "Dropping event for released device");
            return false;
        }
        events.send(event);
        true
    }

    /// Queue a subscription change for a characteristic.
    ///
    /// Turns are handed out in call order, so requests for the same
    /// characteristic run one after another in the order they were queued.
    pub fn enqueue_subscription(&self, characteristic_id: &str) -> SubscriptionTurn {
        let (done, next) = oneshot::channel();
        let previous = self
            .subscription_tails
            .lock()
            .insert(characteristic_id.to_string(), next);
        SubscriptionTurn {
            previous,
            _done: done,
        }
    }

    /// Unregister and forget the registration for a characteristic.
    ///
    /// Returns whether one was present.
    pub(crate) fn remove_notification(&self, characteristic_id: &str) -> bool {
        let Some(registration) = self.notifications.lock().remove(characteristic_id) else {
            return false;
        };
        if let Err(e) = registration
            .characteristic
            .remove_value_changed_handler(registration.token)
        {
            warn!(device_id = %self.address, characteristic_id, error = %e, "Failed to unregister value handler");
        }
        true
    }

    /// Record a new registration for a characteristic.
    ///
    /// If teardown started while the registration was being made, it is
    /// unregistered immediately instead and `false` is returned.
    pub(crate) fn insert_notification(
        &self,
        characteristic_id: &str,
        characteristic: CharacteristicHandle,
        token: EventToken,
    ) -> bool {
        let displaced = {
            let _gate = self.handle.read();
            if self.closing.load(Ordering::Acquire) {
                None
            } else {
                let registration = NotificationRegistration {
                    characteristic: characteristic.clone(),
                    token,
                };
                let previous = self
                    .notifications
                    .lock()
                    .insert(characteristic_id.to_string(), registration);
                Some(previous)
            }
        };

        match displaced {
            Some(previous) => {
                if let Some(previous) = previous
                    && let Err(e) = previous
                        .characteristic
                        .remove_value_changed_handler(previous.token)
                {
                    warn!(device_id = %self.address, characteristic_id, error = %e, "Failed to unregister displaced value handler");
                }
                true
            }
            None => {
                if let Err(e) = characteristic.remove_value_changed_handler(token) {
                    warn!(device_id = %self.address, characteristic_id, error = %e, "Failed to unregister value handler");
                }
                false
            }
        }
    }

    /// Tear the agent down.
    ///
    /// Order: stop accepting work, unregister the connection callback,
    /// unregister every value callback, clear caches, release the handle.
    /// Callers remove the agent from the manager's map before calling this.
    pub(crate) fn shutdown(&self) {
        {
            let _barrier = self.handle.write();
            if self.closing.swap(true, Ordering::AcqRel) {
                return;
            }
        }

        let device = self.handle.read().clone();
        let token = self.connection_token.lock().take();
        if let (Some(device), Some(token)) = (device, token) {
            if let Err(e) = device.remove_connection_status_handler(token) {
                warn!(device_id = %self.address, error = %e, "Failed to unregister connection handler");
            }
        }

        let registrations: Vec<_> = self.notifications.lock().drain().collect();
        for (characteristic_id, registration) in registrations {
            if let Err(e) = registration
                .characteristic
                .remove_value_changed_handler(registration.token)
            {
                warn!(device_id = %self.address, characteristic_id, error = %e, "Failed to unregister value handler");
            }
        }

        self.characteristics.lock().clear();
        self.services.lock().clear();
        self.subscription_tails.lock().clear();

        let released = self.handle.write().take();
        if let Some(device) = released {
            device.close();
        }
        debug!(device_id = %self.address, "Agent released");
    }

    /// Drop a connection that lost a connect race without closing the link.
    pub(crate) fn discard(&self) {
        {
            let _barrier = self.handle.write();
            self.closing.store(true, Ordering::Release);
        }
        let device = self.handle.write().take();
        let token = self.connection_token.lock().take();
        if let (Some(device), Some(token)) = (device, token)
            && let Err(e) = device.remove_connection_status_handler(token)
        {
            warn!(device_id = %self.address, error = %e, "Failed to unregister connection handler");
        }
    }

    /// Number of active notification registrations.
    pub fn notification_count(&self) -> usize {
        self.notifications.lock().len()
    }

    /// Whether notifications are enabled for a characteristic.
    pub fn has_notification(&self, characteristic_id: &str) -> bool {
        self.notifications.lock().contains_key(characteristic_id)
    }

    /// Number of cached services.
    pub fn cached_service_count(&self) -> usize {
        self.services.lock().len()
    }

    /// Number of cached characteristics.
    pub fn cached_characteristic_count(&self) -> usize {
        self.characteristics.lock().len()
    }

    /// Whether the agent still holds its device handle.
    pub fn holds_handle(&self) -> bool {
        self.handle.read().is_some()
    }
}
