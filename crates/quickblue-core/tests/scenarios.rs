//! End-to-end scenarios for quickblue-core against the mock platform.
//!
//! Every request goes through the [`QuickBlue`] facade and every outcome
//! is observed on the event stream, the way a client sees them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

use quickblue_core::mock::{MockCharacteristic, MockDevice, MockPlatform, MockService};
use quickblue_core::{
    ConnectionState, ConnectorEvent, DescriptorValue, DeviceAddress, EventReceiver, MethodCall,
    NotifyMode, QuickBlue, QuickBlueConfig, ReconnectOptions, WriteMode,
};

const SVC_A: &str = "0000180f-0000-1000-8000-00805f9b34fb";
const CHAR_B: &str = "00002a19-0000-1000-8000-00805f9b34fb";
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn address(value: u64) -> DeviceAddress {
    DeviceAddress::new(value).unwrap()
}

fn device(value: u64) -> Arc<MockDevice> {
    MockDevice::builder(value)
        .name("Battery Monitor")
        .service(
            MockService::new(SVC_A)
                .with_characteristic(MockCharacteristic::new(CHAR_B).with_value(&[100])),
        )
        .build()
}

struct Harness {
    platform: Arc<MockPlatform>,
    bridge: QuickBlue,
    events: EventReceiver,
}

impl Harness {
    fn new(devices: &[Arc<MockDevice>]) -> Self {
        Self::with_config(devices, QuickBlueConfig::default())
    }

    fn with_config(devices: &[Arc<MockDevice>], config: QuickBlueConfig) -> Self {
        init_tracing();
        let platform = Arc::new(MockPlatform::new());
        for device in devices {
            platform.add_device(device.clone());
        }
        let bridge = QuickBlue::new(platform.clone(), config).unwrap();
        let events = bridge.subscribe();
        Self {
            platform,
            bridge,
            events,
        }
    }

    async fn next(&mut self) -> ConnectorEvent {
        timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    /// Let spawned tasks run, then return everything that was emitted.
    async fn settle(&mut self) -> Vec<ConnectorEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    async fn connect(&mut self, value: u64) {
        self.bridge.connect(address(value)).unwrap();
        assert_eq!(
            self.next().await,
            connection(value, ConnectionState::Connected)
        );
    }
}

fn connection(value: u64, state: ConnectionState) -> ConnectorEvent {
    ConnectorEvent::ConnectionState {
        device_id: address(value),
        state,
    }
}

fn value_event(value: u64, bytes: &[u8]) -> ConnectorEvent {
    ConnectorEvent::CharacteristicValue {
        device_id: address(value),
        characteristic_id: CHAR_B.to_string(),
        value: bytes.to_vec(),
    }
}

#[tokio::test]
async fn test_connect_with_failing_enumeration() {
    let device = device(42);
    device.fail_service_enumeration(true);
    let mut harness = Harness::new(&[device]);

    harness.bridge.connect(address(42)).unwrap();

    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Disconnected)
    );
    assert!(harness.settle().await.is_empty());
    assert!(!harness.bridge.manager().contains(address(42)));
    assert!(matches!(
        harness.bridge.read_value(address(42), SVC_A, CHAR_B),
        Err(quickblue_core::Error::UnknownDevice(_))
    ));
}

#[tokio::test]
async fn test_characteristic_cache_is_reused() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    for _ in 0..3 {
        harness.bridge.read_value(address(42), SVC_A, CHAR_B).unwrap();
        assert_eq!(harness.next().await, value_event(42, &[100]));
    }

    // One enumeration validated the link, one resolved the characteristic.
    assert_eq!(device.service_enumerations(), 2);
    assert_eq!(device.service(SVC_A).unwrap().characteristic_enumerations(), 1);
}

#[tokio::test]
async fn test_concurrent_reads_before_caching() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    harness.bridge.read_value(address(42), SVC_A, CHAR_B).unwrap();
    harness.bridge.read_value(address(42), SVC_A, CHAR_B).unwrap();

    assert_eq!(harness.next().await, value_event(42, &[100]));
    assert_eq!(harness.next().await, value_event(42, &[100]));
    let agent = harness.bridge.manager().agent(address(42)).unwrap();
    assert_eq!(agent.cached_characteristic_count(), 1);
}

#[tokio::test]
async fn test_short_identifiers_are_normalized() {
    let mut harness = Harness::new(&[device(42)]);
    harness.connect(42).await;

    harness.bridge.read_value(address(42), "180F", "2A19").unwrap();

    assert_eq!(harness.next().await, value_event(42, &[100]));
}

#[tokio::test]
async fn test_notify_then_disable() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    harness
        .bridge
        .set_notifiable(address(42), SVC_A, CHAR_B, NotifyMode::Notification)
        .unwrap();
    harness
        .bridge
        .set_notifiable(address(42), SVC_A, CHAR_B, NotifyMode::Disabled)
        .unwrap();
    harness.settle().await;

    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();
    let agent = harness.bridge.manager().agent(address(42)).unwrap();
    assert!(!agent.has_notification(CHAR_B));
    assert_eq!(characteristic.descriptor(), DescriptorValue::None);
    assert_eq!(characteristic.descriptor_writes(), 2);
    assert_eq!(characteristic.value_handler_count(), 0);
}

#[tokio::test]
async fn test_resubscribe_replaces_registration() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    for mode in [NotifyMode::Notification, NotifyMode::Indication, NotifyMode::Notification] {
        harness
            .bridge
            .set_notifiable(address(42), SVC_A, CHAR_B, mode)
            .unwrap();
    }
    harness.settle().await;

    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();
    assert_eq!(characteristic.value_handler_count(), 1);
    assert_eq!(characteristic.descriptor(), DescriptorValue::Notify);

    characteristic.notify(&[1, 2, 3]);
    assert_eq!(harness.next().await, value_event(42, &[1, 2, 3]));
}

#[tokio::test]
async fn test_failed_subscribe_registers_nothing() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;
    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();
    characteristic.fail_descriptor_writes(true);

    harness
        .bridge
        .set_notifiable(address(42), SVC_A, CHAR_B, NotifyMode::Notification)
        .unwrap();

    assert!(harness.settle().await.is_empty());
    let agent = harness.bridge.manager().agent(address(42)).unwrap();
    assert_eq!(agent.notification_count(), 0);
    assert_eq!(characteristic.value_handler_count(), 0);
}

#[tokio::test]
async fn test_write_is_silent_and_copies_input() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    let mut buffer = vec![0xde, 0xad];
    harness
        .bridge
        .write_value(address(42), SVC_A, CHAR_B, &buffer, WriteMode::WithResponse)
        .unwrap();
    buffer.fill(0);

    assert!(harness.settle().await.is_empty());
    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();
    assert_eq!(
        characteristic.writes(),
        vec![(bytes::Bytes::from_static(&[0xde, 0xad]), WriteMode::WithResponse)]
    );
}

#[tokio::test]
async fn test_disconnect_twice() {
    let device = device(42);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(42).await;

    harness.bridge.disconnect(address(42)).unwrap();
    harness.bridge.disconnect(address(42)).unwrap();

    assert_eq!(
        harness.settle().await,
        vec![connection(42, ConnectionState::Disconnected)]
    );
    assert!(!harness.bridge.manager().contains(address(42)));
    assert_eq!(device.close_count(), 1);
    assert_eq!(device.connection_handler_count(), 0);
}

#[tokio::test]
async fn test_platform_disconnect_during_read() {
    let device = device(7);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(7).await;
    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();
    characteristic.pause_reads();

    harness.bridge.read_value(address(7), SVC_A, CHAR_B).unwrap();
    while characteristic.read_count() == 0 {
        tokio::task::yield_now().await;
    }
    device.simulate_disconnect();
    characteristic.resume_reads();

    assert_eq!(
        harness.settle().await,
        vec![connection(7, ConnectionState::Disconnected)]
    );
    assert!(!harness.bridge.manager().contains(address(7)));
}

#[tokio::test]
async fn test_notifications_stop_after_disconnect() {
    let device = device(7);
    let mut harness = Harness::new(&[device.clone()]);
    harness.connect(7).await;
    harness
        .bridge
        .set_notifiable(address(7), SVC_A, CHAR_B, NotifyMode::Notification)
        .unwrap();
    harness.settle().await;
    let characteristic = device.service(SVC_A).unwrap().characteristic(CHAR_B).unwrap();

    device.simulate_disconnect();
    characteristic.notify(&[9]);

    assert_eq!(
        harness.settle().await,
        vec![connection(7, ConnectionState::Disconnected)]
    );
    assert_eq!(characteristic.value_handler_count(), 0);
}

#[tokio::test]
async fn test_discover_services_through_method_calls() {
    let device = MockDevice::builder(42)
        .service(
            MockService::new(SVC_A)
                .with_characteristic(MockCharacteristic::new(CHAR_B))
                .with_characteristic(MockCharacteristic::new("2a1a")),
        )
        .build();
    let mut harness = Harness::new(&[device]);

    harness
        .bridge
        .handle_method_call(MethodCall::from_json(r#"{"method":"connect","deviceId":"42"}"#).unwrap())
        .await
        .unwrap();
    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Connected)
    );

    let call = MethodCall::from_json(r#"{"method":"discoverServices","deviceId":"42"}"#).unwrap();
    assert_eq!(
        harness.bridge.handle_method_call(call).await.unwrap(),
        serde_json::Value::Null
    );

    match harness.next().await {
        ConnectorEvent::ServiceDiscovered {
            device_id,
            service_id,
            characteristic_ids: Some(mut ids),
        } => {
            ids.sort();
            assert_eq!(device_id, address(42));
            assert_eq!(service_id.as_deref(), Some(SVC_A));
            assert_eq!(
                ids,
                vec![
                    CHAR_B.to_string(),
                    "00002a1a-0000-1000-8000-00805f9b34fb".to_string()
                ]
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_mtu_and_rssi_method_calls() {
    let device = MockDevice::builder(3).mtu(185).rssi(-42).build();
    let mut harness = Harness::new(&[device]);
    harness.connect(3).await;

    for json in [
        r#"{"method":"requestMtu","deviceId":"3","expectedMtu":512}"#,
        r#"{"method":"readRssi","deviceId":"3"}"#,
    ] {
        let call = MethodCall::from_json(json).unwrap();
        harness.bridge.handle_method_call(call).await.unwrap();
    }

    let events = harness.settle().await;
    assert!(events.contains(&ConnectorEvent::MtuNegotiated { mtu: 185 }));
    assert!(events.contains(&ConnectorEvent::RssiRead {
        device_id: address(3),
        rssi: -42,
    }));
}

#[tokio::test]
async fn test_scan_results_stream() {
    let harness = Harness::new(&[device(42)]);
    let mut results = harness.bridge.subscribe_scan_results();
    harness
        .bridge
        .handle_method_call(MethodCall::StartScan { service_id: None })
        .await
        .unwrap();

    harness.platform.advertise(quickblue_core::platform::ReceivedAdvertisement {
        address: address(42),
        local_name: Some("adv name".to_string()),
        manufacturer_data: vec![quickblue_core::platform::ManufacturerData {
            company_id: 0x0059,
            data: vec![0x01],
        }],
        services: Vec::new(),
        rssi: -55,
    });

    let result = timeout(EVENT_TIMEOUT, results.recv())
        .await
        .expect("timed out waiting for scan result")
        .unwrap();
    assert_eq!(result.device_id, address(42));
    assert_eq!(result.name, "Battery Monitor");
    assert_eq!(result.manufacturer_data_head, Some(vec![0x59, 0x00, 0x01]));
    assert_eq!(result.rssi, -55);

    harness
        .bridge
        .handle_method_call(MethodCall::StopScan)
        .await
        .unwrap();
    assert!(!harness.platform.last_watcher().unwrap().is_running());
}

#[tokio::test]
async fn test_scan_with_service_filter() {
    let harness = Harness::new(&[device(42), device(43)]);
    let mut results = harness.bridge.subscribe_scan_results();
    let call = MethodCall::from_json(r#"{"method":"startScan","serviceId":"180f"}"#).unwrap();
    harness.bridge.handle_method_call(call).await.unwrap();

    let advertisement = |value: u64, services| quickblue_core::platform::ReceivedAdvertisement {
        address: address(value),
        local_name: None,
        manufacturer_data: Vec::new(),
        services,
        rssi: -60,
    };
    harness.platform.advertise(advertisement(43, Vec::new()));
    harness.platform.advertise(advertisement(
        42,
        vec![quickblue_core::uuids::parse_uuid(SVC_A).unwrap()],
    ));

    let result = timeout(EVENT_TIMEOUT, results.recv())
        .await
        .expect("timed out waiting for scan result")
        .unwrap();
    assert_eq!(result.device_id, address(42));
    assert!(results.try_recv().is_err());
}

#[tokio::test]
async fn test_auto_connect_survives_link_loss() {
    let device = device(42);
    let config = QuickBlueConfig::default()
        .reconnect(ReconnectOptions::fixed_delay(Duration::from_millis(20)));
    let mut harness = Harness::with_config(&[device.clone()], config);

    let call = MethodCall::from_json(r#"{"method":"autoConnect","deviceId":"42"}"#).unwrap();
    harness.bridge.handle_method_call(call).await.unwrap();
    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Connected)
    );

    device.simulate_disconnect();
    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Disconnected)
    );
    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Connected)
    );

    harness.bridge.disconnect(address(42)).unwrap();
    assert_eq!(
        harness.next().await,
        connection(42, ConnectionState::Disconnected)
    );
    device.simulate_disconnect();
    assert!(harness.settle().await.is_empty());
    assert_eq!(device.service_enumerations(), 2);
}
