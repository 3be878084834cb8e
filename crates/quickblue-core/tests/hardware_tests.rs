//! Hardware integration tests for quickblue-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package quickblue-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the target device via environment variables:
//! - `QUICKBLUE_DEVICE`: decimal device address to connect to
//! - `QUICKBLUE_SERVICE`: service id to read from (default: Battery Service)
//! - `QUICKBLUE_CHARACTERISTIC`: characteristic id to read (default: Battery Level)
//!
//! Example:
//! ```
//! QUICKBLUE_DEVICE=209588367454282 cargo test --package quickblue-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::time::Duration;

use quickblue_core::{
    ConnectionState, ConnectorEvent, DeviceAddress, EventReceiver, QuickBlue, QuickBlueConfig,
};
use tokio::time::{sleep, timeout};

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to scan so the adapter learns about nearby devices
const SCAN_DURATION: Duration = Duration::from_secs(10);

fn get_device() -> Option<DeviceAddress> {
    env::var("QUICKBLUE_DEVICE")
        .ok()
        .and_then(|value| value.parse().ok())
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

async fn wait_for<F>(events: &mut EventReceiver, mut predicate: F) -> ConnectorEvent
where
    F: FnMut(&ConnectorEvent) -> bool,
{
    timeout(BLE_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn scanned_bridge() -> QuickBlue {
    let bridge = QuickBlue::btleplug(QuickBlueConfig::default())
        .await
        .expect("no Bluetooth adapter");
    bridge.start_scan(None).await.expect("scan failed to start");
    sleep(SCAN_DURATION).await;
    bridge.stop_scan().await.expect("scan failed to stop");
    bridge
}

// =============================================================================
// Scan Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_radio_is_available() {
    let bridge = QuickBlue::btleplug(QuickBlueConfig::default())
        .await
        .expect("no Bluetooth adapter");
    assert!(bridge.is_available().await, "radio is not powered on");
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_scan_reports_advertisements() {
    let bridge = QuickBlue::btleplug(QuickBlueConfig::default())
        .await
        .expect("no Bluetooth adapter");
    let mut results = bridge.subscribe_scan_results();

    bridge.start_scan(None).await.unwrap();
    let result = timeout(BLE_TIMEOUT, results.recv()).await;
    bridge.stop_scan().await.unwrap();

    match result {
        Ok(Ok(result)) => println!(
            "Saw {} ({}) at {} dBm",
            result.device_id.mac_string(),
            result.name,
            result.rssi
        ),
        Ok(Err(e)) => panic!("Scan stream failed: {}", e),
        Err(_) => panic!("No advertisement within {:?}", BLE_TIMEOUT),
    }
}

// =============================================================================
// Connection Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_connect_discover_read_disconnect() {
    let Some(device) = get_device() else {
        println!("QUICKBLUE_DEVICE not set, skipping");
        return;
    };
    let service = env_or("QUICKBLUE_SERVICE", "180f");
    let characteristic = env_or("QUICKBLUE_CHARACTERISTIC", "2a19");

    let bridge = scanned_bridge().await;
    let mut events = bridge.subscribe();

    bridge.connect(device).unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, ConnectorEvent::ConnectionState { .. })
    })
    .await;
    assert_eq!(
        event,
        ConnectorEvent::ConnectionState {
            device_id: device,
            state: ConnectionState::Connected,
        }
    );

    bridge.discover_services(device).unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, ConnectorEvent::ServiceDiscovered { .. })
    })
    .await;
    println!("Discovered: {:?}", event);

    bridge.read_value(device, &service, &characteristic).unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, ConnectorEvent::CharacteristicValue { .. })
    })
    .await;
    println!("Read: {:?}", event);

    bridge.disconnect(device).unwrap();
    assert!(!bridge.manager().contains(device));
}
