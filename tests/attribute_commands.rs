mod common;

use std::collections::HashMap;

use gattio::{
    CCC_DESCRIPTOR_UUID, CharacteristicNode, DescriptorNode, ErrorKind, FakeBackendConfig,
    FakePeripheral, PeripheralAddress, ServiceNode, TransportEvent, TransportStatus, WriteMode,
    expand_short_uuid,
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use common::{Recorded, harness};

const HEART_RATE_SERVICE: &str = "0000180D-0000-1000-8000-00805F9B34FB";
const HEART_RATE_MEASUREMENT: &str = "00002A37-0000-1000-8000-00805F9B34FB";
const CCC_DESCRIPTOR: &str = "00002902-0000-1000-8000-00805F9B34FB";

fn battery_level() -> Uuid {
    expand_short_uuid(0x2A19)
}

fn default_pair_config() -> FakeBackendConfig {
    FakeBackendConfig::builder()
        .peripherals(vec![
            FakePeripheral::builder()
                .address("aa:bb:cc")
                .local_name("HRM-Strap")
                .rssi(-43)
                .characteristic_values(HashMap::from([(battery_level(), vec![0x5A])]))
                .build(),
            FakePeripheral::builder()
                .address("dd:ee:ff")
                .local_name("HRM-Watch")
                .rssi(-61)
                .build(),
        ])
        .build()
}

#[tokio::test]
async fn shared_characteristic_uuid_resolves_to_the_same_session_every_time() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.connect_ready("dd:ee:ff").await;
    harness.listener.clear();

    for _ in 0..3 {
        harness.manager.list_attributes("180d").await;
    }

    let owners: Vec<String> = harness
        .listener
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Recorded::ServiceCharacteristics { address, .. } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(vec!["AA:BB:CC"; 3], owners);
}

#[tokio::test]
async fn list_attributes_emits_characteristics_of_the_owning_service() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.list_attributes("180D").await;

    assert_eq!(
        vec![Recorded::ServiceCharacteristics {
            address: "AA:BB:CC".to_string(),
            service: HEART_RATE_SERVICE.to_string(),
            characteristics: vec![
                HEART_RATE_MEASUREMENT.to_string(),
                "00002A39-0000-1000-8000-00805F9B34FB".to_string(),
            ],
        }],
        harness.listener.events()
    );
}

#[tokio::test]
async fn attribute_listings_distinguish_missing_sessions_from_missing_uuids() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.listener.clear();

    harness.manager.list_attributes("180d").await;
    assert_eq!(
        vec![Recorded::Error(ErrorKind::DeviceNotFound)],
        harness.listener.events()
    );
    harness.listener.clear();

    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();
    harness.manager.list_attributes("1800").await;
    assert_eq!(
        vec![Recorded::Error(ErrorKind::DeviceServiceNotFound)],
        harness.listener.events()
    );
    harness.listener.clear();

    harness.manager.list_attributes("not-a-uuid").await;
    assert_eq!(
        vec![Recorded::Error(ErrorKind::DeviceServiceNotFound)],
        harness.listener.events()
    );
}

#[tokio::test]
async fn list_descriptors_emits_the_ccc_descriptor_upper_cased() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.list_descriptors("2a37").await;

    assert_eq!(
        vec![Recorded::CharacteristicDescriptors {
            characteristic: HEART_RATE_MEASUREMENT.to_string(),
            descriptors: vec![CCC_DESCRIPTOR.to_string()],
        }],
        harness.listener.events()
    );
}

#[tokio::test]
async fn read_attribute_delivers_the_value_through_the_read_event() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.read_attribute("2a19").await;
    harness.drain_events().await;

    assert_eq!(
        vec![Recorded::CharacteristicRead {
            characteristic: "00002A19-0000-1000-8000-00805F9B34FB".to_string(),
            value: vec![0x5A],
        }],
        harness.listener.events()
    );
}

#[tokio::test]
async fn write_without_response_emits_a_synthetic_acknowledgment() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.write_attribute("2a39", &[0x01]).await;

    // The acknowledgment is synthesized before any transport completion
    // could arrive.
    assert_eq!(
        vec![Recorded::WriteWithoutResponse {
            characteristic: "00002A39-0000-1000-8000-00805F9B34FB".to_string(),
        }],
        harness.listener.events()
    );

    let writes = harness.backend.recorded_writes();
    assert_eq!(1, writes.len());
    assert_eq!(WriteMode::WithoutResponse, writes[0].mode);
    assert_eq!(vec![0x01], writes[0].payload);

    harness.drain_events().await;
    assert_eq!(
        0,
        harness
            .listener
            .count(|event| matches!(event, Recorded::CharacteristicWritten { .. }))
    );
}

#[tokio::test]
async fn acknowledged_write_confirms_through_the_write_event() {
    let config = FakeBackendConfig::builder()
        .peripherals(vec![
            FakePeripheral::builder()
                .address("aa:bb:cc")
                .local_name("HRM-Strap")
                .services(vec![ServiceNode::new(
                    expand_short_uuid(0x180D),
                    true,
                    vec![CharacteristicNode::new(
                        expand_short_uuid(0x2A39),
                        vec!["write".to_string()],
                        Vec::new(),
                    )],
                )])
                .build(),
        ])
        .build();
    let mut harness = harness(config);
    harness.discover(1).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.write_attribute("2a39", &[0x02]).await;
    harness.drain_events().await;

    assert_eq!(
        vec![Recorded::CharacteristicWritten {
            characteristic: "00002A39-0000-1000-8000-00805F9B34FB".to_string(),
            status: TransportStatus::Success,
        }],
        harness.listener.events()
    );
    assert_eq!(
        WriteMode::WithResponse,
        harness.backend.recorded_writes()[0].mode
    );
}

#[tokio::test]
async fn enabling_notifications_writes_the_notification_value_to_the_ccc() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    // 2A37 advertises notify but not indicate.
    harness.manager.set_notifications("2a37", true).await;

    let descriptor_writes = harness.backend.recorded_descriptor_writes();
    assert_eq!(1, descriptor_writes.len());
    assert_eq!(CCC_DESCRIPTOR_UUID, descriptor_writes[0].descriptor);
    assert_eq!(vec![0x01, 0x00], descriptor_writes[0].payload);
}

#[tokio::test]
async fn indicate_capability_takes_priority_over_notify() {
    let config = FakeBackendConfig::builder()
        .peripherals(vec![
            FakePeripheral::builder()
                .address("aa:bb:cc")
                .local_name("Thermometer")
                .services(vec![ServiceNode::new(
                    expand_short_uuid(0x1809),
                    true,
                    vec![CharacteristicNode::new(
                        expand_short_uuid(0x2A1C),
                        vec!["notify".to_string(), "indicate".to_string()],
                        vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
                    )],
                )])
                .build(),
        ])
        .build();
    let mut harness = harness(config);
    harness.discover(1).await;
    harness.connect_ready("aa:bb:cc").await;

    harness.manager.set_notifications("2a1c", true).await;
    assert_eq!(
        vec![0x02, 0x00],
        harness.backend.recorded_descriptor_writes()[0].payload
    );

    harness.manager.set_notifications("2a1c", false).await;
    assert_eq!(
        vec![0x00, 0x00],
        harness.backend.recorded_descriptor_writes()[1].payload
    );
}

#[tokio::test]
async fn subscription_streams_value_changes_to_listeners() {
    let config = FakeBackendConfig::builder()
        .peripherals(vec![
            FakePeripheral::builder()
                .address("aa:bb:cc")
                .local_name("HRM-Strap")
                .notifications(vec![vec![0x06, 0x48], vec![0x06, 0x49]])
                .build(),
        ])
        .build();
    let mut harness = harness(config);
    harness.discover(1).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.set_notifications("2a37", true).await;
    harness.drain_events().await;

    let changes: Vec<Vec<u8>> = harness
        .listener
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Recorded::CharacteristicChanged { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(vec![vec![0x06, 0x48], vec![0x06, 0x49]], changes);
}

#[tokio::test]
async fn busy_transport_surfaces_independent_step_failures() {
    let config = FakeBackendConfig::builder()
        .peripherals(vec![
            FakePeripheral::builder()
                .address("aa:bb:cc")
                .local_name("HRM-Strap")
                .busy(true)
                .build(),
        ])
        .build();
    let mut harness = harness(config);
    harness.discover(1).await;
    harness.manager.connect("aa:bb:cc").await;
    harness.drain_events().await;
    // Service discovery is refused while busy; seed the tree directly so
    // resolution succeeds and only the attribute requests fail.
    harness.backend.emit(TransportEvent::ServicesDiscovered {
        address: PeripheralAddress::new("aa:bb:cc"),
        services: vec![ServiceNode::new(
            expand_short_uuid(0x180D),
            true,
            vec![CharacteristicNode::new(
                expand_short_uuid(0x2A37),
                vec!["notify".to_string()],
                vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
            )],
        )],
        status: TransportStatus::Success,
    });
    harness.drain_events().await;
    harness.listener.clear();

    harness.manager.read_attribute("2a37").await;
    harness.manager.set_notifications("2a37", true).await;

    assert_eq!(
        vec![
            Recorded::Error(ErrorKind::AttributeReadFailed),
            Recorded::Error(ErrorKind::AttributeDescriptorWriteFailed),
            Recorded::Error(ErrorKind::AttributeNotificationFailed),
        ],
        harness.listener.events()
    );
}

#[tokio::test]
async fn attribute_commands_without_sessions_signal_no_connected_devices() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;

    harness.manager.read_attribute("2a37").await;
    harness.manager.write_attribute("2a37", &[0x00]).await;
    harness.manager.set_notifications("2a37", true).await;

    assert_eq!(
        vec![
            Recorded::NoConnectedDevices,
            Recorded::NoConnectedDevices,
            Recorded::NoConnectedDevices,
        ],
        harness
            .listener
            .events()
            .into_iter()
            .filter(|event| matches!(event, Recorded::NoConnectedDevices))
            .collect::<Vec<_>>()
    );
    assert_eq!(
        0,
        harness
            .listener
            .count(|event| matches!(event, Recorded::Error(_)))
    );
}

#[tokio::test]
async fn late_read_completion_for_a_torn_down_session_is_discarded() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.backend.emit(TransportEvent::CharacteristicRead {
        address: PeripheralAddress::new("11:22:33"),
        service: expand_short_uuid(0x180D),
        characteristic: expand_short_uuid(0x2A37),
        value: vec![0x01],
        status: TransportStatus::Success,
    });
    harness.drain_events().await;

    assert_eq!(Vec::<Recorded>::new(), harness.listener.events());
}

#[tokio::test]
async fn descriptor_round_trip_is_scoped_to_the_parent_characteristic() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.read_descriptor("2902", "2a37", "180d").await;
    harness
        .manager
        .write_descriptor("2902", "2a37", &[0x01, 0x00])
        .await;
    harness.drain_events().await;

    assert_eq!(
        vec![
            Recorded::DescriptorRead {
                descriptor: CCC_DESCRIPTOR.to_string(),
            },
            Recorded::DescriptorWritten {
                descriptor: CCC_DESCRIPTOR.to_string(),
                status: TransportStatus::Success,
            },
        ],
        harness.listener.events()
    );
    assert_eq!(
        vec![0x01, 0x00],
        harness.backend.recorded_descriptor_writes()[0].payload
    );
}

#[tokio::test]
async fn descriptor_lookup_misses_report_descriptor_not_found() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    // 2A39 exists but carries no descriptors.
    harness.manager.read_descriptor("2902", "2a39", "180d").await;
    harness.manager.write_descriptor("2904", "2a37", &[]).await;

    assert_eq!(
        vec![
            Recorded::Error(ErrorKind::AttributeDescriptorNotFound),
            Recorded::Error(ErrorKind::AttributeDescriptorNotFound),
        ],
        harness.listener.events()
    );
}

#[tokio::test]
async fn signal_strength_reading_flows_back_with_the_session_address() {
    let mut harness = harness(default_pair_config());
    harness.discover(2).await;
    harness.connect_ready("aa:bb:cc").await;
    harness.listener.clear();

    harness.manager.read_signal_strength("aa:bb:cc").await;
    harness.drain_events().await;
    harness.manager.read_signal_strength("11:22:33").await;

    assert_eq!(
        vec![
            Recorded::SignalStrength {
                address: "AA:BB:CC".to_string(),
                rssi: Some(-43),
            },
            Recorded::Error(ErrorKind::DeviceNotFound),
        ],
        harness.listener.events()
    );
}
