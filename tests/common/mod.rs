//! Shared harness for integration suites: a recording listener and a
//! session manager wired to the fake backend, with transport completions
//! applied deterministically by the tests themselves.
#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gattio::{
    AttributeValue, AttributeWrite, CharacteristicNode, DescriptorNode, DescriptorValue,
    DescriptorWrite, DeviceEventListener, DiscoveredPeripheral, ErrorKind, FakeBackend,
    FakeBackendConfig, PeripheralAddress, ServiceNode, SessionManager, TransportEventReceiver,
    TransportStatus, canonical_uuid, event_channel,
};
use tokio::time::sleep;

/// Events captured from the listener fan-out, flattened for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Found {
        address: String,
        name: Option<String>,
    },
    Connected {
        address: String,
        name: Option<String>,
    },
    Disconnected {
        address: String,
    },
    ConnectionFailure {
        address: String,
        status: TransportStatus,
    },
    UnexpectedDisconnection {
        address: String,
        status: TransportStatus,
    },
    ServicesDiscovered {
        address: String,
        service_count: usize,
        status: TransportStatus,
    },
    ServiceCharacteristics {
        address: String,
        service: String,
        characteristics: Vec<String>,
    },
    CharacteristicDescriptors {
        characteristic: String,
        descriptors: Vec<String>,
    },
    CharacteristicRead {
        characteristic: String,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        characteristic: String,
        status: TransportStatus,
    },
    CharacteristicChanged {
        characteristic: String,
        value: Vec<u8>,
    },
    DescriptorRead {
        descriptor: String,
    },
    DescriptorWritten {
        descriptor: String,
        status: TransportStatus,
    },
    WriteWithoutResponse {
        characteristic: String,
    },
    SignalStrength {
        address: String,
        rssi: Option<i16>,
    },
    NoConnectedDevices,
    Error(ErrorKind),
}

/// Listener that appends every callback to a shared log.
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.events().iter().filter(|event| predicate(event)).count()
    }

    fn push(&self, event: Recorded) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl DeviceEventListener for RecordingListener {
    fn on_peripheral_found(&self, peripheral: &DiscoveredPeripheral) {
        self.push(Recorded::Found {
            address: peripheral.address().to_string(),
            name: peripheral.local_name().map(ToString::to_string),
        });
    }

    fn on_device_connected(&self, name: Option<&str>, address: &PeripheralAddress) {
        self.push(Recorded::Connected {
            address: address.to_string(),
            name: name.map(ToString::to_string),
        });
    }

    fn on_device_disconnected(&self, _name: Option<&str>, address: &PeripheralAddress) {
        self.push(Recorded::Disconnected {
            address: address.to_string(),
        });
    }

    fn on_connection_failure(
        &self,
        _name: Option<&str>,
        address: &PeripheralAddress,
        status: TransportStatus,
    ) {
        self.push(Recorded::ConnectionFailure {
            address: address.to_string(),
            status,
        });
    }

    fn on_unexpected_disconnection(
        &self,
        _name: Option<&str>,
        address: &PeripheralAddress,
        status: TransportStatus,
    ) {
        self.push(Recorded::UnexpectedDisconnection {
            address: address.to_string(),
            status,
        });
    }

    fn on_services_discovered(
        &self,
        address: &PeripheralAddress,
        services: &[ServiceNode],
        status: TransportStatus,
    ) {
        self.push(Recorded::ServicesDiscovered {
            address: address.to_string(),
            service_count: services.len(),
            status,
        });
    }

    fn on_service_characteristics(
        &self,
        address: &PeripheralAddress,
        service: &str,
        characteristics: &[CharacteristicNode],
    ) {
        self.push(Recorded::ServiceCharacteristics {
            address: address.to_string(),
            service: service.to_string(),
            characteristics: characteristics
                .iter()
                .map(|node| canonical_uuid(node.uuid()))
                .collect(),
        });
    }

    fn on_characteristic_descriptors(
        &self,
        _address: &PeripheralAddress,
        _service: &str,
        characteristic: &str,
        descriptors: &[DescriptorNode],
    ) {
        self.push(Recorded::CharacteristicDescriptors {
            characteristic: characteristic.to_string(),
            descriptors: descriptors
                .iter()
                .map(|node| canonical_uuid(node.uuid()))
                .collect(),
        });
    }

    fn on_characteristic_read(&self, read: &AttributeValue) {
        self.push(Recorded::CharacteristicRead {
            characteristic: read.characteristic.clone(),
            value: read.value.clone(),
        });
    }

    fn on_characteristic_written(&self, write: &AttributeWrite) {
        self.push(Recorded::CharacteristicWritten {
            characteristic: write.characteristic.clone(),
            status: write.status,
        });
    }

    fn on_characteristic_changed(&self, change: &AttributeValue) {
        self.push(Recorded::CharacteristicChanged {
            characteristic: change.characteristic.clone(),
            value: change.value.clone(),
        });
    }

    fn on_descriptor_read(&self, read: &DescriptorValue) {
        self.push(Recorded::DescriptorRead {
            descriptor: read.descriptor.clone(),
        });
    }

    fn on_descriptor_written(&self, write: &DescriptorWrite) {
        self.push(Recorded::DescriptorWritten {
            descriptor: write.descriptor.clone(),
            status: write.status,
        });
    }

    fn on_write_without_response(&self, write: &AttributeWrite) {
        self.push(Recorded::WriteWithoutResponse {
            characteristic: write.characteristic.clone(),
        });
    }

    fn on_signal_strength(
        &self,
        address: &PeripheralAddress,
        _name: Option<&str>,
        rssi: Option<i16>,
        _status: TransportStatus,
    ) {
        self.push(Recorded::SignalStrength {
            address: address.to_string(),
            rssi,
        });
    }

    fn on_no_connected_devices(&self) {
        self.push(Recorded::NoConnectedDevices);
    }

    fn on_error(&self, error: ErrorKind) {
        self.push(Recorded::Error(error));
    }
}

/// A session manager over the fake backend with a recording listener.
pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub manager: SessionManager,
    pub listener: Arc<RecordingListener>,
    pub events: TransportEventReceiver,
}

pub fn harness(config: FakeBackendConfig) -> Harness {
    let (sender, events) = event_channel();
    let backend = Arc::new(FakeBackend::new(config, sender));
    let manager = SessionManager::new(backend.clone(), backend.clone());
    let listener = RecordingListener::new();
    manager.register_listener(listener.clone());
    Harness {
        backend,
        manager,
        listener,
        events,
    }
}

impl Harness {
    /// Applies every queued transport completion to the session state.
    pub async fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.manager.handle_transport_event(event).await;
        }
    }

    /// Runs one discovery round and waits until `expected` peripherals
    /// populate the available set.
    pub async fn discover(&mut self, expected: usize) {
        self.manager.start_discovery(None, false).await;
        let manager = self.manager.clone();
        wait_until(|| {
            let manager = manager.clone();
            async move { manager.available_peripherals().await.len() >= expected }
        })
        .await;
        self.manager.stop_discovery().await;
    }

    /// Connects a peripheral and discovers its services, applying all
    /// completions so the session ends up ready for attribute commands.
    pub async fn connect_ready(&mut self, address: &str) {
        self.manager.connect(address).await;
        self.drain_events().await;
        self.manager.list_services(address).await;
        self.drain_events().await;
    }
}

/// Polls a condition with small sleeps until it holds.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met in time");
}
