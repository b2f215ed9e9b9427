//! Transport and discovery capabilities.
//!
//! The radio layer is consumed through two traits: `PeripheralTransport`
//! queues GATT requests and `DiscoveryScanner` produces advertisement
//! reports. Queued requests complete asynchronously as `TransportEvent`
//! values on an unbounded channel, correlated to their session by
//! peripheral address; a synchronous `Err` from a trait method means the
//! request was never queued.

mod btleplug_backend;
mod fake_backend;

use std::sync::Arc;

use async_trait::async_trait;
use serde_with::SerializeDisplay;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use self::btleplug_backend::BtleplugBackend;
pub use self::fake_backend::{
    FakeBackend, FakeBackendConfig, FakePeripheral, NotificationPayloads, RecordedDescriptorWrite,
    RecordedWrite, ScanFixture,
};
use crate::error::TransportError;
use crate::identifier::PeripheralAddress;
use crate::model::ServiceNode;

/// Opaque per-connection handle issued by a transport backend. Each
/// session owns exactly one and must release it exactly once.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("{_0}")]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

/// Write acknowledgment modes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub enum WriteMode {
    #[display("with_response")]
    WithResponse,
    #[display("without_response")]
    WithoutResponse,
}

/// Status codes carried by transport completions. Backends map their
/// platform codes onto this fixed set; the session manager classifies
/// non-success codes into graceful, failed and unexpected outcomes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub enum TransportStatus {
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("connection_timeout")]
    ConnectionTimeout,
    #[display("link_loss")]
    LinkLoss,
}

impl TransportStatus {
    /// Returns whether the completion reported success.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// The transport's view of a link after a connection-state change.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Asynchronous completion events delivered by transport backends.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionState {
        address: PeripheralAddress,
        state: LinkState,
        status: TransportStatus,
    },
    ServicesDiscovered {
        address: PeripheralAddress,
        services: Vec<ServiceNode>,
        status: TransportStatus,
    },
    CharacteristicRead {
        address: PeripheralAddress,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        status: TransportStatus,
    },
    CharacteristicWritten {
        address: PeripheralAddress,
        service: Uuid,
        characteristic: Uuid,
        status: TransportStatus,
    },
    CharacteristicChanged {
        address: PeripheralAddress,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DescriptorRead {
        address: PeripheralAddress,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
        status: TransportStatus,
    },
    DescriptorWritten {
        address: PeripheralAddress,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        status: TransportStatus,
    },
    SignalStrength {
        address: PeripheralAddress,
        rssi: Option<i16>,
        status: TransportStatus,
    },
}

/// Sends transport completions towards the session manager.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receives transport completions; drained by the manager's event pump.
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the completion channel shared by a backend and the manager.
#[must_use]
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// One advertisement observation produced by a discovery scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    address: PeripheralAddress,
    local_name: Option<String>,
    rssi: Option<i16>,
    advertisement: Vec<u8>,
}

impl ScanReport {
    /// Creates a scan report from one advertisement.
    #[must_use]
    pub fn new(
        address: PeripheralAddress,
        local_name: Option<String>,
        rssi: Option<i16>,
        advertisement: Vec<u8>,
    ) -> Self {
        Self {
            address,
            local_name,
            rssi,
            advertisement,
        }
    }

    /// Returns the advertising peripheral's address.
    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the observed signal strength, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns the raw advertising payload.
    #[must_use]
    pub fn advertisement(&self) -> &[u8] {
        &self.advertisement
    }
}

/// GATT request queue implemented by the platform radio layer.
///
/// Every method returns as soon as the request is queued; completions
/// arrive as `TransportEvent`s. `release` frees the per-connection
/// resources behind a handle and must be called exactly once per handle.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Requests a connection and issues a handle for the pending session.
    async fn connect(&self, address: &PeripheralAddress)
    -> Result<TransportHandle, TransportError>;

    /// Requests an orderly disconnect.
    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError>;

    /// Requests discovery of the peripheral's service tree.
    async fn discover_services(&self, handle: TransportHandle) -> Result<(), TransportError>;

    /// Queues a characteristic read.
    async fn read_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Queues a characteristic write.
    async fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Queues a descriptor read.
    async fn read_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), TransportError>;

    /// Queues a descriptor write.
    async fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Toggles local delivery of value-change notifications.
    async fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), TransportError>;

    /// Queues an RSSI read for the connected peripheral.
    async fn read_signal_strength(&self, handle: TransportHandle) -> Result<(), TransportError>;

    /// Releases the resources behind a handle.
    async fn release(&self, handle: TransportHandle);
}

/// Advertisement scan implemented by the platform radio layer.
#[async_trait]
pub trait DiscoveryScanner: Send + Sync {
    /// Starts a scan and returns its report stream. The stream is
    /// possibly infinite and ends after `stop`.
    async fn start(
        &self,
        duplicates_allowed: bool,
    ) -> Result<mpsc::UnboundedReceiver<ScanReport>, TransportError>;

    /// Stops the running scan.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Extracts advertised service UUIDs from a raw advertising payload.
    fn parse_service_uuids(&self, advertisement: &[u8]) -> Vec<Uuid> {
        crate::advertisement::service_uuids(advertisement)
    }
}

/// Runtime backend selection.
#[derive(Debug)]
pub enum TransportBackend {
    /// The `btleplug` radio backend.
    Real,
    /// The fixture-driven fake backend.
    Fake(FakeBackendConfig),
}

/// Builds the transport and scanner clients for a runtime backend, along
/// with the completion stream to feed the session manager's event pump.
pub async fn backend_clients(
    backend: TransportBackend,
) -> Result<
    (
        Arc<dyn PeripheralTransport>,
        Arc<dyn DiscoveryScanner>,
        TransportEventReceiver,
    ),
    TransportError,
> {
    let (events, receiver) = event_channel();
    match backend {
        TransportBackend::Real => {
            let backend = Arc::new(BtleplugBackend::new(events).await?);
            let transport: Arc<dyn PeripheralTransport> = backend.clone();
            let scanner: Arc<dyn DiscoveryScanner> = backend;
            Ok((transport, scanner, receiver))
        }
        TransportBackend::Fake(config) => {
            tracing::info!("using fake BLE backend");
            let backend = Arc::new(FakeBackend::new(config, events));
            let transport: Arc<dyn PeripheralTransport> = backend.clone();
            let scanner: Arc<dyn DiscoveryScanner> = backend;
            Ok((transport, scanner, receiver))
        }
    }
}
