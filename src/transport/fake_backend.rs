//! Fixture-driven transport and scanner used in tests and non-hardware
//! environments.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use super::{
    DiscoveryScanner, LinkState, PeripheralTransport, ScanReport, TransportEvent,
    TransportEventSender, TransportHandle, TransportStatus, WriteMode,
};
use crate::error::{FixtureError, TransportError};
use crate::identifier::{CCC_DESCRIPTOR_UUID, PeripheralAddress, expand_short_uuid};
use crate::model::{CharacteristicNode, DescriptorNode, ServiceNode};

/// One scripted peripheral in the fake fixture.
#[derive(Debug, Clone, Builder)]
pub struct FakePeripheral {
    #[builder(with = |value: &str| PeripheralAddress::new(value))]
    address: PeripheralAddress,
    #[builder(into)]
    local_name: Option<String>,
    rssi: Option<i16>,
    #[builder(default)]
    advertisement: Vec<u8>,
    #[builder(default = default_services())]
    services: Vec<ServiceNode>,
    /// Completion status reported for a connect request; defaults to
    /// success.
    connect_status: Option<TransportStatus>,
    /// When set, attribute requests are refused at queue time.
    #[builder(default)]
    busy: bool,
    #[builder(default)]
    characteristic_values: HashMap<Uuid, Vec<u8>>,
    #[builder(default)]
    notifications: Vec<Vec<u8>>,
}

impl FakePeripheral {
    fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicNode> {
        self.services
            .iter()
            .find(|node| node.uuid() == service)
            .and_then(|node| node.find_characteristic(characteristic))
    }
}

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    peripherals: Vec<FakePeripheral>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let peripherals = parse_scan_fixture(value)?;
        Ok(Self { peripherals })
    }
}

/// Parsed fake notification payload fixtures.
#[derive(Debug, Clone, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = parse_notifications(value)?;
        Ok(Self { payloads })
    }
}

/// Settings for constructing a fake backend.
#[derive(Debug, Builder)]
pub struct FakeBackendConfig {
    #[builder(into)]
    peripherals: Vec<FakePeripheral>,
    /// Notification payloads replayed on subscription for peripherals
    /// without their own fixtures.
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    discovery_delay: Duration,
}

/// A characteristic write observed by the fake transport.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub address: PeripheralAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub mode: WriteMode,
}

/// A descriptor write observed by the fake transport.
#[derive(Debug, Clone)]
pub struct RecordedDescriptorWrite {
    pub address: PeripheralAddress,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
    pub payload: Vec<u8>,
}

/// Fake backend implementing both transport and scanner over fixtures.
#[derive(Debug)]
pub struct FakeBackend {
    events: TransportEventSender,
    inner: Mutex<FakeState>,
}

#[derive(Debug)]
struct FakeState {
    peripherals: Vec<FakePeripheral>,
    default_notifications: Vec<Vec<u8>>,
    discovery_delay: Duration,
    next_handle: u64,
    connected: HashMap<u64, PeripheralAddress>,
    connect_requests: usize,
    released: Vec<TransportHandle>,
    writes: Vec<RecordedWrite>,
    descriptor_writes: Vec<RecordedDescriptorWrite>,
    scan_reports: Option<mpsc::UnboundedSender<ScanReport>>,
    scan_task: Option<JoinHandle<()>>,
}

impl FakeBackend {
    /// Creates a fake backend from fixture settings.
    #[must_use]
    pub fn new(config: FakeBackendConfig, events: TransportEventSender) -> Self {
        Self {
            events,
            inner: Mutex::new(FakeState {
                peripherals: config.peripherals,
                default_notifications: config.notifications.map(Into::into).unwrap_or_default(),
                discovery_delay: config.discovery_delay,
                next_handle: 0,
                connected: HashMap::new(),
                connect_requests: 0,
                released: Vec::new(),
                writes: Vec::new(),
                descriptor_writes: Vec::new(),
                scan_reports: None,
                scan_task: None,
            }),
        }
    }

    /// Injects a raw transport event, for scripting losses and races.
    pub fn emit(&self, event: TransportEvent) {
        self.forward(event);
    }

    /// Returns every handle release observed, duplicates included.
    #[must_use]
    pub fn released_handles(&self) -> Vec<TransportHandle> {
        self.lock().released.clone()
    }

    /// Returns how many connect requests reached the transport.
    #[must_use]
    pub fn connect_requests(&self) -> usize {
        self.lock().connect_requests
    }

    /// Returns the characteristic writes observed so far.
    #[must_use]
    pub fn recorded_writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    /// Returns the descriptor writes observed so far.
    #[must_use]
    pub fn recorded_descriptor_writes(&self) -> Vec<RecordedDescriptorWrite> {
        self.lock().descriptor_writes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("transport event receiver dropped");
        }
    }

    fn peripheral_for_handle(
        &self,
        handle: TransportHandle,
    ) -> Result<(PeripheralAddress, FakePeripheral), TransportError> {
        let state = self.lock();
        let address = state
            .connected
            .get(&handle.raw())
            .cloned()
            .ok_or(TransportError::UnknownHandle { handle })?;
        let peripheral = state
            .peripherals
            .iter()
            .find(|peripheral| peripheral.address == address)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral {
                address: address.clone(),
            })?;
        Ok((address, peripheral))
    }

    fn queueable_peripheral(
        &self,
        handle: TransportHandle,
    ) -> Result<(PeripheralAddress, FakePeripheral), TransportError> {
        let (address, peripheral) = self.peripheral_for_handle(handle)?;
        if peripheral.busy {
            return Err(TransportError::Busy);
        }
        Ok((address, peripheral))
    }
}

#[async_trait]
impl PeripheralTransport for FakeBackend {
    async fn connect(
        &self,
        address: &PeripheralAddress,
    ) -> Result<TransportHandle, TransportError> {
        let (handle, status) = {
            let mut state = self.lock();
            state.connect_requests += 1;
            let peripheral = state
                .peripherals
                .iter()
                .find(|peripheral| &peripheral.address == address)
                .ok_or_else(|| TransportError::UnknownPeripheral {
                    address: address.clone(),
                })?;
            let status = peripheral.connect_status.unwrap_or(TransportStatus::Success);
            state.next_handle += 1;
            let handle = TransportHandle::new(state.next_handle);
            state.connected.insert(handle.raw(), address.clone());
            (handle, status)
        };

        let state = if status.is_success() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.forward(TransportEvent::ConnectionState {
            address: address.clone(),
            state,
            status,
        });
        Ok(handle)
    }

    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, _peripheral) = self.peripheral_for_handle(handle)?;
        self.forward(TransportEvent::ConnectionState {
            address,
            state: LinkState::Disconnected,
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn discover_services(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        self.forward(TransportEvent::ServicesDiscovered {
            address,
            services: peripheral.services.clone(),
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        peripheral
            .find_characteristic(service, characteristic)
            .ok_or(TransportError::UnknownAttribute {
                uuid: characteristic,
            })?;
        let value = peripheral
            .characteristic_values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        self.forward(TransportEvent::CharacteristicRead {
            address,
            service,
            characteristic,
            value,
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        peripheral
            .find_characteristic(service, characteristic)
            .ok_or(TransportError::UnknownAttribute {
                uuid: characteristic,
            })?;
        self.lock().writes.push(RecordedWrite {
            address: address.clone(),
            service,
            characteristic,
            payload: payload.to_vec(),
            mode,
        });
        if mode == WriteMode::WithResponse {
            self.forward(TransportEvent::CharacteristicWritten {
                address,
                service,
                characteristic,
                status: TransportStatus::Success,
            });
        }
        Ok(())
    }

    async fn read_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        peripheral
            .find_characteristic(service, characteristic)
            .and_then(|node| node.find_descriptor(descriptor))
            .ok_or(TransportError::UnknownAttribute { uuid: descriptor })?;
        self.forward(TransportEvent::DescriptorRead {
            address,
            service,
            characteristic,
            descriptor,
            value: Vec::new(),
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        peripheral
            .find_characteristic(service, characteristic)
            .and_then(|node| node.find_descriptor(descriptor))
            .ok_or(TransportError::UnknownAttribute { uuid: descriptor })?;
        self.lock().descriptor_writes.push(RecordedDescriptorWrite {
            address: address.clone(),
            characteristic,
            descriptor,
            payload: payload.to_vec(),
        });
        self.forward(TransportEvent::DescriptorWritten {
            address,
            service,
            characteristic,
            descriptor,
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.queueable_peripheral(handle)?;
        peripheral
            .find_characteristic(service, characteristic)
            .ok_or(TransportError::UnknownAttribute {
                uuid: characteristic,
            })?;
        if !enable {
            return Ok(());
        }

        let payloads = if peripheral.notifications.is_empty() {
            self.lock().default_notifications.clone()
        } else {
            peripheral.notifications.clone()
        };
        for payload in payloads {
            self.forward(TransportEvent::CharacteristicChanged {
                address: address.clone(),
                service,
                characteristic,
                value: payload,
            });
        }
        Ok(())
    }

    async fn read_signal_strength(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, peripheral) = self.peripheral_for_handle(handle)?;
        self.forward(TransportEvent::SignalStrength {
            address,
            rssi: peripheral.rssi,
            status: TransportStatus::Success,
        });
        Ok(())
    }

    async fn release(&self, handle: TransportHandle) {
        let mut state = self.lock();
        state.connected.remove(&handle.raw());
        state.released.push(handle);
    }
}

#[async_trait]
impl DiscoveryScanner for FakeBackend {
    async fn start(
        &self,
        duplicates_allowed: bool,
    ) -> Result<mpsc::UnboundedReceiver<ScanReport>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (peripherals, delay) = {
            let mut state = self.lock();
            state.scan_reports = Some(sender.clone());
            (state.peripherals.clone(), state.discovery_delay)
        };

        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let rounds = if duplicates_allowed { 2 } else { 1 };
            for _ in 0..rounds {
                for peripheral in &peripherals {
                    let report = ScanReport::new(
                        peripheral.address.clone(),
                        peripheral.local_name.clone(),
                        peripheral.rssi,
                        peripheral.advertisement.clone(),
                    );
                    if sender.send(report).is_err() {
                        return;
                    }
                }
            }
        });
        self.lock().scan_task = Some(task);
        Ok(receiver)
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let (sender, task) = {
            let mut state = self.lock();
            (state.scan_reports.take(), state.scan_task.take())
        };
        drop(sender);
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FakePeripheral>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FakePeripheral, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = (fields[1] != "-").then(|| fields[1].to_string());
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };
    let advertisement = if fields[3] == "-" {
        Vec::new()
    } else {
        hex::decode(fields[3])?
    };

    Ok(FakePeripheral::builder()
        .address(fields[0])
        .maybe_local_name(local_name)
        .maybe_rssi(rssi)
        .advertisement(advertisement)
        .build())
}

fn parse_notifications(raw_value: &str) -> Result<Vec<Vec<u8>>, FixtureError> {
    if raw_value.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw_value
        .split(',')
        .map(|payload| hex::decode(payload.trim()).map_err(FixtureError::from))
        .collect()
}

/// Generic GATT tree used by fixtures that do not script their own:
/// heart-rate measurement (notify + CCC), heart-rate control point
/// (acknowledged and unacknowledged writes) and battery level.
fn default_services() -> Vec<ServiceNode> {
    vec![
        ServiceNode::new(
            expand_short_uuid(0x180D),
            true,
            vec![
                CharacteristicNode::new(
                    expand_short_uuid(0x2A37),
                    vec!["notify".to_string()],
                    vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
                ),
                CharacteristicNode::new(
                    expand_short_uuid(0x2A39),
                    vec!["write".to_string(), "write_without_response".to_string()],
                    Vec::new(),
                ),
            ],
        ),
        ServiceNode::new(
            expand_short_uuid(0x180F),
            true,
            vec![CharacteristicNode::new(
                expand_short_uuid(0x2A19),
                vec!["read".to_string(), "notify".to_string()],
                vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
            )],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB:CC|HRM-Strap|-43|-", 1)]
    #[case("AA:BB:CC|HRM-Strap|-43|-;DD:EE:FF|-|-|020d18", 2)]
    fn parse_scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let peripherals = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, peripherals.len());
    }

    #[test]
    fn parse_scan_fixture_keeps_placeholder_fields_empty() {
        let peripherals =
            parse_scan_fixture("aa:bb:cc|-|-|05030d180f18").expect("fixture should parse");

        assert_eq!("AA:BB:CC", peripherals[0].address.as_str());
        assert_eq!(None, peripherals[0].local_name);
        assert_eq!(None, peripherals[0].rssi);
        assert_eq!(
            vec![0x05, 0x03, 0x0D, 0x18, 0x0F, 0x18],
            peripherals[0].advertisement
        );
    }

    #[test]
    fn parse_scan_fixture_rejects_invalid_field_count() {
        let result = parse_scan_fixture("AA:BB:CC|HRM-Strap|-43");
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[test]
    fn parse_scan_fixture_rejects_odd_hex_payload() {
        let result = parse_scan_fixture("AA:BB:CC|HRM-Strap|-43|ABC");
        assert_matches!(result, Err(FixtureError::InvalidHex(_)));
    }

    #[test]
    fn parse_notifications_splits_comma_separated_payloads() {
        let payloads = parse_notifications("0102, 0a0b0c").expect("payloads should parse");
        assert_eq!(vec![vec![0x01, 0x02], vec![0x0A, 0x0B, 0x0C]], payloads);
    }

    #[test]
    fn default_services_expose_heart_rate_and_battery() {
        let services = default_services();
        let uuids: Vec<Uuid> = services.iter().map(ServiceNode::uuid).collect();
        assert_eq!(vec![expand_short_uuid(0x180D), expand_short_uuid(0x180F)], uuids);
    }
}
