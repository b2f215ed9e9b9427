//! The session manager: the public command surface over discovery, the
//! connection state machine, attribute resolution and event fan-out.
//!
//! Commands never return failures; every outcome, success or error, is
//! delivered to registered listeners. Command handling and transport
//! callbacks serialize on one lock around the available-peripheral set
//! and the session registry, so set mutation is always mutually exclusive
//! with iteration. A transport callback whose address no longer has a
//! session is discarded.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::event::{
    AttributeValue, AttributeWrite, DescriptorValue, DescriptorWrite, DeviceEventListener,
    ListenerRegistry,
};
use crate::identifier::{PeripheralAddress, canonical_uuid, parse_attribute_uuid};
use crate::model::{
    DISABLE_NOTIFICATION_VALUE, DiscoveredPeripheral, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE, ServiceState,
};
use crate::resolver::{self, AttributeKind, ResolveError};
use crate::session::{ConnectionSession, SessionRegistry, SessionState};
use crate::transport::{
    DiscoveryScanner, LinkState, PeripheralTransport, ScanReport, TransportEvent, TransportStatus,
    WriteMode,
};

/// Orchestrates concurrent peripheral sessions on a central device.
///
/// Cheap to clone; clones share the same session state and listeners.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn PeripheralTransport>,
    scanner: Arc<dyn DiscoveryScanner>,
    listeners: ListenerRegistry,
    state: Mutex<ManagerState>,
    service_state: std::sync::Mutex<ServiceState>,
}

struct ManagerState {
    available: Vec<DiscoveredPeripheral>,
    sessions: SessionRegistry,
    scanning: bool,
    scan_generation: u64,
    scan_cancel: Option<CancellationToken>,
}

enum CommandFailure {
    NoConnectedDevices,
    Report(ErrorKind),
}

impl SessionManager {
    /// Creates a manager over the given transport and scanner.
    #[must_use]
    pub fn new(
        transport: Arc<dyn PeripheralTransport>,
        scanner: Arc<dyn DiscoveryScanner>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                scanner,
                listeners: ListenerRegistry::new(),
                state: Mutex::new(ManagerState {
                    available: Vec::new(),
                    sessions: SessionRegistry::new(),
                    scanning: false,
                    scan_generation: 0,
                    scan_cancel: None,
                }),
                service_state: std::sync::Mutex::new(ServiceState::default()),
            }),
        }
    }

    /// Registers a listener at the end of the dispatch order.
    pub fn register_listener(&self, listener: Arc<dyn DeviceEventListener>) {
        self.inner.listeners.register(listener);
    }

    /// Deregisters a listener by identity.
    pub fn deregister_listener(&self, listener: &Arc<dyn DeviceEventListener>) {
        self.inner.listeners.deregister(listener);
    }

    /// Records the adapter availability reported by the platform.
    pub fn set_service_state(&self, state: ServiceState) {
        let mut current = self
            .inner
            .service_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            info!(from = %*current, to = %state, "adapter service state changed");
            *current = state;
        }
    }

    /// Returns the last reported adapter availability.
    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        *self
            .inner
            .service_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of the available-peripheral set.
    pub async fn available_peripherals(&self) -> Vec<DiscoveredPeripheral> {
        self.inner.state.lock().await.available.clone()
    }

    /// Returns the addresses of live sessions, in session-set order.
    pub async fn connected_addresses(&self) -> Vec<PeripheralAddress> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .iter()
            .map(|session| session.address().clone())
            .collect()
    }

    /// Returns whether a discovery scan is running.
    pub async fn discovery_active(&self) -> bool {
        self.inner.state.lock().await.scanning
    }

    /// Spawns the task that drives transport completions onto the session
    /// state. The pump ends when the transport drops its event sender.
    pub fn spawn_event_pump(
        &self,
        mut events: crate::transport::TransportEventReceiver,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_transport_event(event).await;
            }
        })
    }

    /// Starts a discovery scan, clearing the available set. A second start
    /// while a scan is running is a no-op. With a timeout hint the scan is
    /// stopped after the hint elapses.
    #[instrument(skip(self), level = "debug", fields(?timeout, duplicates_allowed))]
    pub async fn start_discovery(
        &self,
        timeout: Option<Duration>,
        duplicates_allowed: bool,
    ) {
        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.scanning {
                debug!("discovery already running");
                return;
            }
            state.available.clear();

            let reports = match self.inner.scanner.start(duplicates_allowed).await {
                Ok(reports) => reports,
                Err(error) => {
                    warn!(?error, "failed to start discovery scan");
                    return;
                }
            };
            state.scanning = true;
            state.scan_generation += 1;
            let cancel = CancellationToken::new();
            state.scan_cancel = Some(cancel.clone());

            let manager = self.clone();
            tokio::spawn(async move {
                manager.pump_scan_reports(reports, cancel).await;
            });
            state.scan_generation
        };

        if let Some(timeout) = timeout {
            let manager = self.clone();
            tokio::spawn(async move {
                sleep(timeout).await;
                manager.finish_discovery(Some(generation)).await;
            });
        }
    }

    /// Stops the running discovery scan, if any.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop_discovery(&self) {
        self.finish_discovery(None).await;
    }

    /// Requests a connection. The address must be in the available set;
    /// unknown addresses are reported as `device_not_found` and never
    /// reach the transport. An address with a live session is a no-op.
    #[instrument(skip(self), level = "debug", fields(address))]
    pub async fn connect(&self, address: &str) {
        let address = PeripheralAddress::new(address);
        let failure = {
            let mut state = self.inner.state.lock().await;
            let local_name = state
                .available
                .iter()
                .find(|peripheral| peripheral.address() == &address)
                .map(|peripheral| peripheral.local_name().map(ToString::to_string));
            let Some(local_name) = local_name else {
                debug!(%address, "connect requested for a peripheral outside the available set");
                drop(state);
                self.emit_error(ErrorKind::DeviceNotFound);
                return;
            };
            if state
                .sessions
                .get(&address)
                .is_some_and(|session| !session.state().is_terminal())
            {
                debug!(%address, "peripheral already has a live session");
                return;
            }

            match self.inner.transport.connect(&address).await {
                Ok(handle) => {
                    state
                        .sessions
                        .insert(ConnectionSession::new(address, local_name, handle));
                    None
                }
                Err(error) => {
                    warn!(%address, ?error, "transport refused connect request");
                    Some((local_name, address))
                }
            }
        };

        if let Some((local_name, address)) = failure {
            self.inner.listeners.notify_each(|listener| {
                listener.on_connection_failure(
                    local_name.as_deref(),
                    &address,
                    TransportStatus::Failure,
                );
            });
        }
    }

    /// Requests an orderly disconnect. Valid from any non-terminal state;
    /// repeated requests while one is in flight are no-ops.
    #[instrument(skip(self), level = "debug", fields(address))]
    pub async fn disconnect(&self, address: &str) {
        let address = PeripheralAddress::new(address);
        let mut state = self.inner.state.lock().await;
        let Some(session) = state.sessions.get_mut(&address) else {
            drop(state);
            self.emit_error(ErrorKind::DeviceNotFound);
            return;
        };
        if !session.begin_disconnect() {
            debug!(%address, "disconnect already in progress");
            return;
        }
        let handle = session.handle();
        if let Err(error) = self.inner.transport.disconnect(handle).await {
            warn!(%address, ?error, "transport refused disconnect request");
        }
    }

    /// Issues service discovery for a connected session. The resulting
    /// tree arrives through the services-discovered event.
    #[instrument(skip(self), level = "debug", fields(address))]
    pub async fn list_services(&self, address: &str) {
        let address = PeripheralAddress::new(address);
        let failure = {
            let mut state = self.inner.state.lock().await;
            match state.sessions.get_mut(&address) {
                None => Some(ErrorKind::DeviceNotFound),
                Some(session) => {
                    if !session.begin_service_discovery() {
                        debug!(
                            %address,
                            state = %session.state(),
                            "service discovery not permitted in this state"
                        );
                        Some(ErrorKind::DeviceNotFound)
                    } else {
                        let handle = session.handle();
                        if let Err(error) = self.inner.transport.discover_services(handle).await {
                            warn!(%address, ?error, "transport refused service discovery");
                            session.cancel_service_discovery();
                        }
                        None
                    }
                }
            }
        };
        if let Some(kind) = failure {
            self.emit_error(kind);
        }
    }

    /// Resolves a service across all sessions and lists its
    /// characteristics to listeners.
    #[instrument(skip(self), level = "debug", fields(service))]
    pub async fn list_attributes(&self, service: &str) {
        let Ok(uuid) = parse_attribute_uuid(service) else {
            self.emit_error(ErrorKind::DeviceServiceNotFound);
            return;
        };

        let outcome = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                Err(ErrorKind::DeviceNotFound)
            } else {
                match resolver::find_service(&state.sessions, uuid) {
                    Ok(found) => Ok((
                        found.session.address().clone(),
                        canonical_uuid(found.service.uuid()),
                        found.service.characteristics().to_vec(),
                    )),
                    Err(_) => Err(ErrorKind::DeviceServiceNotFound),
                }
            }
        };

        match outcome {
            Ok((address, service, characteristics)) => {
                self.inner.listeners.notify_each(|listener| {
                    listener.on_service_characteristics(&address, &service, &characteristics);
                });
            }
            Err(kind) => self.emit_error(kind),
        }
    }

    /// Resolves a characteristic across all sessions and lists its
    /// descriptors to listeners.
    #[instrument(skip(self), level = "debug", fields(characteristic))]
    pub async fn list_descriptors(&self, characteristic: &str) {
        let Ok(uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };

        let outcome = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                Err(ErrorKind::DeviceNotFound)
            } else {
                match resolver::find_characteristic(&state.sessions, uuid) {
                    Ok(found) => Ok((
                        found.session.address().clone(),
                        canonical_uuid(found.service.uuid()),
                        canonical_uuid(found.characteristic.uuid()),
                        found.characteristic.descriptors().to_vec(),
                    )),
                    Err(_) => Err(ErrorKind::DeviceAttributesNotFound),
                }
            }
        };

        match outcome {
            Ok((address, service, characteristic, descriptors)) => {
                self.inner.listeners.notify_each(|listener| {
                    listener.on_characteristic_descriptors(
                        &address,
                        &service,
                        &characteristic,
                        &descriptors,
                    );
                });
            }
            Err(kind) => self.emit_error(kind),
        }
    }

    /// Queues an asynchronous read of a characteristic value. The value
    /// arrives through the characteristic-read event.
    #[instrument(skip(self), level = "debug", fields(characteristic))]
    pub async fn read_attribute(&self, characteristic: &str) {
        let Ok(uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };

        let failure = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                Some(CommandFailure::NoConnectedDevices)
            } else {
                match resolver::find_characteristic(&state.sessions, uuid) {
                    Err(_) => Some(CommandFailure::Report(ErrorKind::DeviceAttributesNotFound)),
                    Ok(found) => {
                        let request = self
                            .inner
                            .transport
                            .read_characteristic(
                                found.session.handle(),
                                found.service.uuid(),
                                found.characteristic.uuid(),
                            )
                            .await;
                        match request {
                            Ok(()) => None,
                            Err(error) => {
                                warn!(%uuid, ?error, "transport refused characteristic read");
                                Some(CommandFailure::Report(ErrorKind::AttributeReadFailed))
                            }
                        }
                    }
                }
            }
        };
        self.dispatch_failure(failure);
    }

    /// Writes a characteristic value. When the characteristic advertises
    /// the write-without-response capability that mode is selected and a
    /// synthetic acknowledgment is emitted immediately, since the
    /// transport will not confirm such writes; otherwise the acknowledged
    /// mode is used and confirmation arrives through the write event.
    #[instrument(skip(self, payload), level = "debug", fields(characteristic, payload_len = payload.len()))]
    pub async fn write_attribute(&self, characteristic: &str, payload: &[u8]) {
        let Ok(uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };

        let (synthetic_ack, failure) = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                (None, Some(CommandFailure::NoConnectedDevices))
            } else {
                match resolver::find_characteristic(&state.sessions, uuid) {
                    Err(_) => (
                        None,
                        Some(CommandFailure::Report(ErrorKind::DeviceAttributesNotFound)),
                    ),
                    Ok(found) => {
                        let mode = if found.characteristic.supports_write_without_response() {
                            WriteMode::WithoutResponse
                        } else {
                            WriteMode::WithResponse
                        };
                        let ack = (mode == WriteMode::WithoutResponse).then(|| AttributeWrite {
                            address: found.session.address().clone(),
                            service: canonical_uuid(found.service.uuid()),
                            characteristic: canonical_uuid(found.characteristic.uuid()),
                            status: TransportStatus::Success,
                        });
                        let request = self
                            .inner
                            .transport
                            .write_characteristic(
                                found.session.handle(),
                                found.service.uuid(),
                                found.characteristic.uuid(),
                                payload,
                                mode,
                            )
                            .await;
                        match request {
                            Ok(()) => (ack, None),
                            Err(error) => {
                                warn!(%uuid, ?error, "transport refused characteristic write");
                                (
                                    ack,
                                    Some(CommandFailure::Report(ErrorKind::AttributeWriteFailed)),
                                )
                            }
                        }
                    }
                }
            }
        };

        if let Some(ack) = synthetic_ack {
            self.inner.listeners
                .notify_each(|listener| listener.on_write_without_response(&ack));
        }
        self.dispatch_failure(failure);
    }

    /// Enables or disables value-change delivery for a characteristic by
    /// writing its CCC descriptor and toggling transport-local delivery.
    /// Indication encoding takes priority over notification when the
    /// characteristic advertises it. The two steps fail independently.
    #[instrument(skip(self), level = "debug", fields(characteristic, enable))]
    pub async fn set_notifications(&self, characteristic: &str, enable: bool) {
        let Ok(uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };

        let mut no_connected = false;
        let mut failures: Vec<ErrorKind> = Vec::new();
        {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                no_connected = true;
            } else {
                match resolver::find_characteristic(&state.sessions, uuid) {
                    Err(_) => failures.push(ErrorKind::DeviceAttributesNotFound),
                    Ok(found) => {
                        let handle = found.session.handle();
                        let service = found.service.uuid();
                        let target = found.characteristic.uuid();

                        match found.characteristic.ccc_descriptor() {
                            None => {
                                warn!(%uuid, "characteristic has no CCC descriptor");
                                failures.push(ErrorKind::AttributeDescriptorWriteFailed);
                            }
                            Some(descriptor) => {
                                let value = if !enable {
                                    DISABLE_NOTIFICATION_VALUE
                                } else if found.characteristic.supports_indicate() {
                                    ENABLE_INDICATION_VALUE
                                } else {
                                    ENABLE_NOTIFICATION_VALUE
                                };
                                let request = self
                                    .inner
                                    .transport
                                    .write_descriptor(
                                        handle,
                                        service,
                                        target,
                                        descriptor.uuid(),
                                        &value,
                                    )
                                    .await;
                                if let Err(error) = request {
                                    warn!(%uuid, ?error, "transport refused CCC descriptor write");
                                    failures.push(ErrorKind::AttributeDescriptorWriteFailed);
                                }
                            }
                        }

                        let request = self
                            .inner
                            .transport
                            .set_characteristic_notification(handle, service, target, enable)
                            .await;
                        if let Err(error) = request {
                            warn!(%uuid, ?error, "transport refused notification toggle");
                            failures.push(ErrorKind::AttributeNotificationFailed);
                        }
                    }
                }
            }
        }

        if no_connected {
            self.inner.listeners
                .notify_each(|listener| listener.on_no_connected_devices());
        }
        for kind in failures {
            self.emit_error(kind);
        }
    }

    /// Queues a descriptor read, scoped to the parent characteristic
    /// since descriptor UUIDs repeat across characteristics.
    #[instrument(skip(self), level = "debug", fields(descriptor, characteristic, service))]
    pub async fn read_descriptor(&self, descriptor: &str, characteristic: &str, service: &str) {
        let Ok(descriptor_uuid) = parse_attribute_uuid(descriptor) else {
            self.emit_error(ErrorKind::AttributeDescriptorNotFound);
            return;
        };
        let Ok(characteristic_uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };
        if parse_attribute_uuid(service).is_err() {
            self.emit_error(ErrorKind::DeviceServiceNotFound);
            return;
        }

        let failure = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                Some(CommandFailure::NoConnectedDevices)
            } else {
                match resolver::find_descriptor(
                    &state.sessions,
                    descriptor_uuid,
                    Some(characteristic_uuid),
                ) {
                    Err(error) => Some(CommandFailure::Report(descriptor_miss_kind(&error))),
                    Ok(found) => {
                        let request = self
                            .inner
                            .transport
                            .read_descriptor(
                                found.session.handle(),
                                found.service.uuid(),
                                found.characteristic.uuid(),
                                found.descriptor.uuid(),
                            )
                            .await;
                        match request {
                            Ok(()) => None,
                            Err(error) => {
                                warn!(%descriptor_uuid, ?error, "transport refused descriptor read");
                                Some(CommandFailure::Report(
                                    ErrorKind::AttributeDescriptorReadFailed,
                                ))
                            }
                        }
                    }
                }
            }
        };
        self.dispatch_failure(failure);
    }

    /// Writes a descriptor value, scoped to the parent characteristic.
    #[instrument(skip(self, payload), level = "debug", fields(descriptor, characteristic, payload_len = payload.len()))]
    pub async fn write_descriptor(&self, descriptor: &str, characteristic: &str, payload: &[u8]) {
        let Ok(descriptor_uuid) = parse_attribute_uuid(descriptor) else {
            self.emit_error(ErrorKind::AttributeDescriptorNotFound);
            return;
        };
        let Ok(characteristic_uuid) = parse_attribute_uuid(characteristic) else {
            self.emit_error(ErrorKind::DeviceAttributesNotFound);
            return;
        };

        let failure = {
            let state = self.inner.state.lock().await;
            if state.sessions.is_empty() {
                Some(CommandFailure::NoConnectedDevices)
            } else {
                match resolver::find_descriptor(
                    &state.sessions,
                    descriptor_uuid,
                    Some(characteristic_uuid),
                ) {
                    Err(error) => Some(CommandFailure::Report(descriptor_miss_kind(&error))),
                    Ok(found) => {
                        let request = self
                            .inner
                            .transport
                            .write_descriptor(
                                found.session.handle(),
                                found.service.uuid(),
                                found.characteristic.uuid(),
                                found.descriptor.uuid(),
                                payload,
                            )
                            .await;
                        match request {
                            Ok(()) => None,
                            Err(error) => {
                                warn!(%descriptor_uuid, ?error, "transport refused descriptor write");
                                Some(CommandFailure::Report(
                                    ErrorKind::AttributeDescriptorWriteFailed,
                                ))
                            }
                        }
                    }
                }
            }
        };
        self.dispatch_failure(failure);
    }

    /// Queues an RSSI read for a connected session. The reading arrives
    /// through the signal-strength event.
    #[instrument(skip(self), level = "debug", fields(address))]
    pub async fn read_signal_strength(&self, address: &str) {
        let address = PeripheralAddress::new(address);
        let failure = {
            let state = self.inner.state.lock().await;
            match state.sessions.get(&address) {
                Some(session) if !session.state().is_terminal() => {
                    if let Err(error) =
                        self.inner.transport.read_signal_strength(session.handle()).await
                    {
                        warn!(%address, ?error, "transport refused signal strength read");
                    }
                    None
                }
                _ => Some(ErrorKind::DeviceNotFound),
            }
        };
        if let Some(kind) = failure {
            self.emit_error(kind);
        }
    }

    /// Sweeps all remaining sessions: stops discovery, issues best-effort
    /// disconnects and releases every transport handle.
    #[instrument(skip(self), level = "debug")]
    pub async fn shutdown(&self) {
        self.stop_discovery().await;
        let sessions = {
            let mut state = self.inner.state.lock().await;
            state.sessions.drain()
        };
        for mut session in sessions {
            session.finish(SessionState::Closed);
            if let Some(handle) = session.take_handle() {
                if let Err(error) = self.inner.transport.disconnect(handle).await {
                    debug!(address = %session.address(), ?error, "disconnect during shutdown failed");
                }
                self.inner.transport.release(handle).await;
            }
        }
    }

    /// Applies one transport completion to the session state and fans the
    /// normalized event out to listeners.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionState {
                address,
                state,
                status,
            } => self.on_connection_state(address, state, status).await,
            TransportEvent::ServicesDiscovered {
                address,
                services,
                status,
            } => {
                let applied = {
                    let mut state = self.inner.state.lock().await;
                    match state.sessions.get_mut(&address) {
                        Some(session) if !session.state().is_terminal() => {
                            session.complete_service_discovery(services.clone());
                            true
                        }
                        _ => false,
                    }
                };
                if !applied {
                    debug!(%address, "discarding service discovery for unknown session");
                    return;
                }
                self.inner.listeners.notify_each(|listener| {
                    listener.on_services_discovered(&address, &services, status);
                });
            }
            TransportEvent::CharacteristicRead {
                address,
                service,
                characteristic,
                value,
                status,
            } => {
                if !self.session_live(&address).await {
                    debug!(%address, "discarding late characteristic read");
                    return;
                }
                let read = attribute_value(address, service, characteristic, value, status);
                self.inner.listeners
                    .notify_each(|listener| listener.on_characteristic_read(&read));
            }
            TransportEvent::CharacteristicWritten {
                address,
                service,
                characteristic,
                status,
            } => {
                if !self.session_live(&address).await {
                    debug!(%address, "discarding late characteristic write completion");
                    return;
                }
                let write = AttributeWrite {
                    address,
                    service: canonical_uuid(service),
                    characteristic: canonical_uuid(characteristic),
                    status,
                };
                self.inner.listeners
                    .notify_each(|listener| listener.on_characteristic_written(&write));
            }
            TransportEvent::CharacteristicChanged {
                address,
                service,
                characteristic,
                value,
            } => {
                if !self.session_live(&address).await {
                    debug!(%address, "discarding notification for torn-down session");
                    return;
                }
                let change = attribute_value(
                    address,
                    service,
                    characteristic,
                    value,
                    TransportStatus::Success,
                );
                self.inner.listeners
                    .notify_each(|listener| listener.on_characteristic_changed(&change));
            }
            TransportEvent::DescriptorRead {
                address,
                service,
                characteristic,
                descriptor,
                value,
                status,
            } => {
                if !self.session_live(&address).await {
                    debug!(%address, "discarding late descriptor read");
                    return;
                }
                let read = DescriptorValue {
                    address,
                    service: canonical_uuid(service),
                    characteristic: canonical_uuid(characteristic),
                    descriptor: canonical_uuid(descriptor),
                    value,
                    status,
                };
                self.inner.listeners
                    .notify_each(|listener| listener.on_descriptor_read(&read));
            }
            TransportEvent::DescriptorWritten {
                address,
                service,
                characteristic,
                descriptor,
                status,
            } => {
                if !self.session_live(&address).await {
                    debug!(%address, "discarding late descriptor write completion");
                    return;
                }
                let write = DescriptorWrite {
                    address,
                    service: canonical_uuid(service),
                    characteristic: canonical_uuid(characteristic),
                    descriptor: canonical_uuid(descriptor),
                    status,
                };
                self.inner.listeners
                    .notify_each(|listener| listener.on_descriptor_written(&write));
            }
            TransportEvent::SignalStrength {
                address,
                rssi,
                status,
            } => {
                let name = {
                    let state = self.inner.state.lock().await;
                    match state.sessions.get(&address) {
                        Some(session) if !session.state().is_terminal() => {
                            session.local_name().map(ToString::to_string)
                        }
                        _ => {
                            debug!(%address, "discarding late signal strength reading");
                            return;
                        }
                    }
                };
                self.inner.listeners.notify_each(|listener| {
                    listener.on_signal_strength(&address, name.as_deref(), rssi, status);
                });
            }
        }
    }

    async fn on_connection_state(
        &self,
        address: PeripheralAddress,
        link: LinkState,
        status: TransportStatus,
    ) {
        match (link, status) {
            (LinkState::Connected, TransportStatus::Success) => {
                let name = {
                    let mut state = self.inner.state.lock().await;
                    match state.sessions.get_mut(&address) {
                        Some(session) if session.mark_connected() => {
                            session.local_name().map(ToString::to_string)
                        }
                        _ => {
                            debug!(%address, "discarding connection confirmation without a pending session");
                            return;
                        }
                    }
                };
                info!(%address, "peripheral connected");
                self.inner.listeners.notify_each(|listener| {
                    listener.on_device_connected(name.as_deref(), &address);
                });
            }
            (LinkState::Disconnected, TransportStatus::Success) => {
                let Some(name) = self.close_session(&address, SessionState::Closed).await else {
                    return;
                };
                info!(%address, "peripheral disconnected");
                self.inner.listeners.notify_each(|listener| {
                    listener.on_device_disconnected(name.as_deref(), &address);
                });
            }
            (_, TransportStatus::Failure) => {
                let Some(name) = self.close_session(&address, SessionState::Failed).await else {
                    return;
                };
                warn!(%address, %status, "peripheral connection failed");
                self.inner.listeners.notify_each(|listener| {
                    listener.on_connection_failure(name.as_deref(), &address, status);
                });
            }
            (_, TransportStatus::ConnectionTimeout | TransportStatus::LinkLoss) => {
                let Some(name) = self.close_session(&address, SessionState::Closed).await else {
                    return;
                };
                warn!(%address, %status, "peripheral unexpectedly disconnected");
                self.inner.listeners.notify_each(|listener| {
                    listener.on_unexpected_disconnection(name.as_deref(), &address, status);
                });
            }
        }
    }

    /// Removes a session and releases its handle, exactly once across
    /// racing teardown paths. Returns the captured name, or `None` when
    /// the callback is late and there is nothing to tear down.
    async fn close_session(
        &self,
        address: &PeripheralAddress,
        terminal: SessionState,
    ) -> Option<Option<String>> {
        let session = {
            let mut state = self.inner.state.lock().await;
            state.sessions.remove(address)
        };
        let Some(mut session) = session else {
            debug!(%address, "discarding disconnect for unknown session");
            return None;
        };
        session.finish(terminal);
        let name = session.local_name().map(ToString::to_string);
        if let Some(handle) = session.take_handle() {
            self.inner.transport.release(handle).await;
        }
        Some(name)
    }

    async fn session_live(&self, address: &PeripheralAddress) -> bool {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .get(address)
            .is_some_and(|session| !session.state().is_terminal())
    }

    async fn pump_scan_reports(
        &self,
        mut reports: tokio::sync::mpsc::UnboundedReceiver<ScanReport>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                report = reports.recv() => match report {
                    Some(report) => self.handle_scan_report(report).await,
                    None => {
                        let mut state = self.inner.state.lock().await;
                        state.scanning = false;
                        state.scan_cancel = None;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_scan_report(&self, report: ScanReport) {
        let service_uuids = self.inner.scanner.parse_service_uuids(report.advertisement());
        let peripheral = DiscoveredPeripheral::new(
            report.address().clone(),
            report.local_name().map(ToString::to_string),
            report.rssi(),
            report.advertisement().to_vec(),
            service_uuids,
        );

        {
            let mut state = self.inner.state.lock().await;
            let position = state
                .available
                .iter()
                .position(|candidate| candidate.address() == peripheral.address());
            match position {
                Some(index) => state.available[index] = peripheral.clone(),
                None => state.available.push(peripheral.clone()),
            }
        }

        self.inner.listeners
            .notify_each(|listener| listener.on_peripheral_found(&peripheral));
    }

    async fn finish_discovery(&self, expected_generation: Option<u64>) {
        let cancel = {
            let mut state = self.inner.state.lock().await;
            if !state.scanning {
                return;
            }
            if let Some(expected) = expected_generation
                && state.scan_generation != expected
            {
                return;
            }
            state.scanning = false;
            state.scan_cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Err(error) = self.inner.scanner.stop().await {
            warn!(?error, "failed to stop discovery scan");
        }
    }

    fn emit_error(&self, kind: ErrorKind) {
        self.inner.listeners
            .notify_each(|listener| listener.on_error(kind));
    }

    fn dispatch_failure(&self, failure: Option<CommandFailure>) {
        match failure {
            None => {}
            Some(CommandFailure::NoConnectedDevices) => {
                self.inner.listeners
                    .notify_each(|listener| listener.on_no_connected_devices());
            }
            Some(CommandFailure::Report(kind)) => self.emit_error(kind),
        }
    }
}

fn attribute_value(
    address: PeripheralAddress,
    service: Uuid,
    characteristic: Uuid,
    value: Vec<u8>,
    status: TransportStatus,
) -> AttributeValue {
    AttributeValue {
        address,
        service: canonical_uuid(service),
        characteristic: canonical_uuid(characteristic),
        value,
        status,
    }
}

fn descriptor_miss_kind(error: &ResolveError) -> ErrorKind {
    match error {
        ResolveError::NotFound {
            kind: AttributeKind::Characteristic,
            ..
        } => ErrorKind::DeviceAttributesNotFound,
        _ => ErrorKind::AttributeDescriptorNotFound,
    }
}
