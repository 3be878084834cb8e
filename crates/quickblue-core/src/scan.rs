//! Advertisement scanning.
//!
//! The [`ScanWatcher`] owns at most one platform advertisement watcher. It is
//! created on the first start, reused by later starts, and released by stop
//! so the next start begins from scratch. Every received advertisement that
//! passes the current filter produces one [`ScanResult`]; nothing is
//! de-duplicated.

use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use quickblue_types::DeviceAddress;
use quickblue_types::codec::manufacturer_data_head;

use crate::error::Result;
use crate::events::{EventDispatcher, ScanReceiver, ScanResult};
use crate::platform::{
    AdvertisementFilter, AdvertisementHandler, BlePlatform, EventToken, ReceivedAdvertisement,
    WatcherHandle,
};

struct ActiveWatcher {
    watcher: WatcherHandle,
    received_token: Option<EventToken>,
}

/// Drives the platform advertisement watcher and forwards scan results.
pub struct ScanWatcher {
    platform: Arc<dyn BlePlatform>,
    active: Mutex<Option<ActiveWatcher>>,
    results: EventDispatcher<ScanResult>,
    runtime: Handle,
}

impl std::fmt::Debug for ScanWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanWatcher")
            .field("receivers", &self.results.receiver_count())
            .finish_non_exhaustive()
    }
}

impl ScanWatcher {
    /// Create a scan watcher. Name resolution tasks are spawned on `runtime`.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        results: EventDispatcher<ScanResult>,
        runtime: Handle,
    ) -> Self {
        Self {
            platform,
            active: Mutex::new(None),
            results,
            runtime,
        }
    }

    /// Subscribe to scan results.
    pub fn subscribe(&self) -> ScanReceiver {
        self.results.subscribe()
    }

    /// Whether a watcher instance is currently held.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start scanning. Calling this while a scan is running is harmless,
    /// and switches the running scan to `filter`.
    pub async fn start_scan(&self, filter: AdvertisementFilter) -> Result<()> {
        let mut active = self.active.lock().await;
        let current = match active.take() {
            Some(current) => current,
            None => {
                debug!("Creating advertisement watcher");
                ActiveWatcher {
                    watcher: self.platform.advertisement_watcher()?,
                    received_token: None,
                }
            }
        };
        let current = active.insert(current);

        if current.received_token.is_none() {
            let token = current
                .watcher
                .add_received_handler(self.received_handler());
            current.received_token = Some(token);
        }
        current.watcher.start(filter).await?;
        info!(service = ?filter.service, "Scan started");
        Ok(())
    }

    /// Stop scanning and release the watcher. A no-op when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        let Some(current) = active.take() else {
            debug!("Scan not running");
            return Ok(());
        };

        let stopped = current.watcher.stop().await;
        if let Some(token) = current.received_token {
            if let Err(e) = current.watcher.remove_received_handler(token) {
                warn!("Failed to unregister advertisement handler: {}", e);
            }
        }
        info!("Scan stopped");
        stopped
    }

    fn received_handler(&self) -> AdvertisementHandler {
        let platform: Weak<dyn BlePlatform> = Arc::downgrade(&self.platform);
        let results = self.results.clone();
        let runtime = self.runtime.clone();
        Arc::new(move |advertisement| {
            let platform = platform.clone();
            let results = results.clone();
            runtime.spawn(async move {
                let name = resolve_name(&platform, &advertisement).await;
                results.send(scan_result(advertisement, name));
            });
        })
    }
}

/// Resolve the advertiser's public name, falling back to the advertised one.
async fn resolve_name(
    platform: &Weak<dyn BlePlatform>,
    advertisement: &ReceivedAdvertisement,
) -> String {
    let fallback = || advertisement.local_name.clone().unwrap_or_default();
    let Some(platform) = platform.upgrade() else {
        return fallback();
    };
    match public_name(platform.as_ref(), advertisement.address).await {
        Ok(Some(name)) if !name.is_empty() => name,
        Ok(_) => fallback(),
        Err(e) => {
            debug!("Name lookup for {} failed: {}", advertisement.address, e);
            fallback()
        }
    }
}

async fn public_name(platform: &dyn BlePlatform, address: DeviceAddress) -> Result<Option<String>> {
    match platform.device_from_address(address).await? {
        Some(device) => device.name().await,
        None => Ok(None),
    }
}

fn scan_result(advertisement: ReceivedAdvertisement, name: String) -> ScanResult {
    let head = advertisement
        .manufacturer_data
        .first()
        .map(|element| manufacturer_data_head(element.company_id, &element.data));
    ScanResult {
        device_id: advertisement.address,
        name,
        manufacturer_data_head: head,
        rssi: advertisement.rssi,
    }
}
