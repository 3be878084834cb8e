//! GATT operations layered over a [`DeviceAgent`].
//!
//! Every operation is an independent task that ends in at most one outbound
//! event. Failures never escape: each public method wraps an inner
//! `Result`-returning body and logs whatever it returns.
//!
//! | Operation | Success | Failure |
//! |-----------|---------|---------|
//! | discover services | one `service_discovered` per service | one `service_discovered` without a service id |
//! | set notifiable | none | none |
//! | request MTU | `mtu_negotiated` | none |
//! | read value | `characteristic_value` | none |
//! | write value | none | none |
//! | read RSSI | `rssi_read` | none |

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, info, warn};

use quickblue_types::codec::{from_buffer, to_hex_string};
use quickblue_types::uuids::format_uuid;
use quickblue_types::{NotifyMode, WriteMode};

use crate::agent::{DeviceAgent, SubscriptionTurn};
use crate::error::{Error, Result};
use crate::events::ConnectorEvent;
use crate::manager::ConnectionManager;
use crate::platform::{CharacteristicHandle, ValueChanged, ValueChangedHandler};

/// Runs GATT operations against connected devices.
#[derive(Debug, Clone)]
pub struct GattOrchestrator {
    manager: Arc<ConnectionManager>,
}

impl GattOrchestrator {
    /// Create an orchestrator over a connection manager.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Enumerate services and their characteristics, one event per service.
    ///
    /// Enumerated handles also warm the agent's caches.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %agent.address()))]
    pub async fn discover_services(&self, agent: Arc<DeviceAgent>) {
        if let Err(e) = self.try_discover_services(&agent).await {
            warn!("Service discovery failed for {}: {}", agent.address(), e);
            // The handle may be gone; report the address the agent was created with.
            self.manager.events().send(ConnectorEvent::ServiceDiscovered {
                device_id: agent.address(),
                service_id: None,
                characteristic_ids: None,
            });
        }
    }

    async fn try_discover_services(&self, agent: &DeviceAgent) -> Result<()> {
        let device = agent
            .device()
            .ok_or_else(|| Error::DeviceReleased(agent.address().to_string()))?;
        let services = device.gatt_services().await?;
        debug!("Discovered {} services on {}", services.len(), agent.address());

        for service in services {
            let service_id = format_uuid(&service.uuid());
            agent.cache_service(&service_id, service.clone());

            let characteristic_ids = match service.characteristics().await {
                Ok(characteristics) => Some(
                    characteristics
                        .into_iter()
                        .map(|characteristic| {
                            let id = format_uuid(&characteristic.uuid());
                            agent.cache_characteristic(&id, characteristic);
                            id
                        })
                        .collect::<Vec<_>>(),
                ),
                Err(e) => {
                    warn!(
                        device_id = %agent.address(),
                        service_id,
                        error = %e,
                        "Characteristic enumeration failed"
                    );
                    None
                }
            };

            agent.emit_if_live(
                self.manager.events(),
                ConnectorEvent::ServiceDiscovered {
                    device_id: agent.address(),
                    service_id: Some(service_id),
                    characteristic_ids,
                },
            );
        }
        Ok(())
    }

    /// Enable or disable value-changed delivery for a characteristic.
    ///
    /// `turn` must come from [`DeviceAgent::enqueue_subscription`] for the
    /// same characteristic, taken when the request was accepted.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(device_id = %agent.address(), characteristic_id, ?mode)
    )]
    pub async fn set_notifiable(
        &self,
        agent: Arc<DeviceAgent>,
        service_id: &str,
        characteristic_id: &str,
        mode: NotifyMode,
        mut turn: SubscriptionTurn,
    ) {
        turn.wait().await;
        if let Err(e) = self
            .try_set_notifiable(&agent, service_id, characteristic_id, mode)
            .await
        {
            warn!(
                "Failed to set {:?} on {} for {}: {}",
                mode,
                characteristic_id,
                agent.address(),
                e
            );
        }
        drop(turn);
    }

    async fn try_set_notifiable(
        &self,
        agent: &DeviceAgent,
        service_id: &str,
        characteristic_id: &str,
        mode: NotifyMode,
    ) -> Result<()> {
        if !agent.is_connected().await {
            return Err(Error::DeviceReleased(agent.address().to_string()));
        }
        let characteristic = self
            .characteristic(agent, service_id, characteristic_id)
            .await?;

        if !mode.is_enabled() {
            // Local state goes first, so a failed write cannot leave a stale registration.
            agent.remove_notification(characteristic_id);
            characteristic
                .write_client_configuration(mode.descriptor_value())
                .await?;
            info!("Disabled notifications on {}", characteristic_id);
            return Ok(());
        }

        characteristic
            .write_client_configuration(mode.descriptor_value())
            .await?;

        // Any previous registration stays until the new one is in place.
        let token = characteristic
            .add_value_changed_handler(self.value_handler())
            .await?;
        if agent.insert_notification(characteristic_id, characteristic, token) {
            info!("Enabled {:?} on {}", mode, characteristic_id);
        }
        Ok(())
    }

    fn value_handler(&self) -> ValueChangedHandler {
        let manager: Weak<ConnectionManager> = Arc::downgrade(&self.manager);
        Arc::new(move |change| {
            if let Some(manager) = manager.upgrade() {
                deliver_value_changed(&manager, change);
            }
        })
    }

    /// Negotiate the link MTU and report the platform's answer.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %agent.address(), expected_mtu))]
    pub async fn request_mtu(&self, agent: Arc<DeviceAgent>, expected_mtu: u16) {
        match self.try_request_mtu(&agent, expected_mtu).await {
            Ok(mtu) => {
                debug!("Negotiated MTU {} with {}", mtu, agent.address());
                agent.emit_if_live(self.manager.events(), ConnectorEvent::MtuNegotiated { mtu });
            }
            Err(e) => warn!("MTU request failed for {}: {}", agent.address(), e),
        }
    }

    async fn try_request_mtu(&self, agent: &DeviceAgent, expected_mtu: u16) -> Result<u16> {
        let device = agent
            .device()
            .ok_or_else(|| Error::DeviceReleased(agent.address().to_string()))?;
        device.negotiate_mtu(expected_mtu).await
    }

    /// Read a characteristic and report its value.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %agent.address(), characteristic_id))]
    pub async fn read_value(
        &self,
        agent: Arc<DeviceAgent>,
        service_id: &str,
        characteristic_id: &str,
    ) {
        match self
            .try_read_value(&agent, service_id, characteristic_id)
            .await
        {
            Ok(value) => {
                agent.emit_if_live(
                    self.manager.events(),
                    ConnectorEvent::CharacteristicValue {
                        device_id: agent.address(),
                        characteristic_id: characteristic_id.to_string(),
                        value: from_buffer(&value),
                    },
                );
            }
            Err(e) => warn!(
                "Read of {} on {} failed: {}",
                characteristic_id,
                agent.address(),
                e
            ),
        }
    }

    async fn try_read_value(
        &self,
        agent: &DeviceAgent,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Bytes> {
        let characteristic = self
            .characteristic(agent, service_id, characteristic_id)
            .await?;
        characteristic.read_value().await
    }

    /// Write a characteristic. Success is silent; failures are only logged.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(device_id = %agent.address(), characteristic_id, ?mode)
    )]
    pub async fn write_value(
        &self,
        agent: Arc<DeviceAgent>,
        service_id: &str,
        characteristic_id: &str,
        value: Bytes,
        mode: WriteMode,
    ) {
        if let Err(e) = self
            .try_write_value(&agent, service_id, characteristic_id, value, mode)
            .await
        {
            warn!(
                "Write to {} on {} failed: {}",
                characteristic_id,
                agent.address(),
                e
            );
        }
    }

    async fn try_write_value(
        &self,
        agent: &DeviceAgent,
        service_id: &str,
        characteristic_id: &str,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        if !agent.is_connected().await {
            return Err(Error::DeviceReleased(agent.address().to_string()));
        }
        let characteristic = self
            .characteristic(agent, service_id, characteristic_id)
            .await?;
        debug!("Writing {} to {}", to_hex_string(&value), characteristic_id);
        characteristic.write_value(value, mode).await
    }

    /// Read the link RSSI and report it.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %agent.address()))]
    pub async fn read_rssi(&self, agent: Arc<DeviceAgent>) {
        let result = match agent.device() {
            Some(device) => device.rssi().await,
            None => Err(Error::DeviceReleased(agent.address().to_string())),
        };
        match result {
            Ok(rssi) => {
                agent.emit_if_live(
                    self.manager.events(),
                    ConnectorEvent::RssiRead {
                        device_id: agent.address(),
                        rssi,
                    },
                );
            }
            Err(e) => warn!("RSSI read failed for {}: {}", agent.address(), e),
        }
    }

    async fn characteristic(
        &self,
        agent: &DeviceAgent,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<CharacteristicHandle> {
        agent
            .get_characteristic(service_id, characteristic_id)
            .await
            .ok_or_else(|| Error::attribute_not_found(format!("{service_id}/{characteristic_id}")))
    }
}

/// Forward a platform value change as a `characteristic_value` event.
///
/// The change is dropped, with a warning, unless the characteristic, the
/// value, the owning service and a live agent for the owning device are
/// all still resolvable.
pub fn deliver_value_changed(manager: &ConnectionManager, change: ValueChanged) {
    let Some(characteristic) = change.characteristic else {
        warn!("Value change without a characteristic, dropping");
        return;
    };
    let characteristic_id = format_uuid(&characteristic.uuid());
    let Some(value) = change.value else {
        warn!("Value change on {} without a value, dropping", characteristic_id);
        return;
    };
    if characteristic.service_uuid().is_none() {
        warn!("Value change on {} without a service, dropping", characteristic_id);
        return;
    }
    let Some(address) = characteristic.device_address() else {
        warn!("Value change on {} without a device, dropping", characteristic_id);
        return;
    };
    let Some(agent) = manager.agent(address) else {
        debug!("Value change on {} for disconnected {}, dropping", characteristic_id, address);
        return;
    };

    agent.emit_if_live(
        manager.events(),
        ConnectorEvent::CharacteristicValue {
            device_id: address,
            characteristic_id,
            value: from_buffer(&value),
        },
    );
}
