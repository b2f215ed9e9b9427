//! Transport and scanner backed by `btleplug`.
//!
//! The platform API completes GATT calls as futures; each queued request
//! is driven in a spawned task whose outcome is forwarded as a
//! `TransportEvent`, so callers observe the same queue-then-callback
//! shape as on radio stacks with explicit completion callbacks.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Descriptor, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    DiscoveryScanner, LinkState, PeripheralTransport, ScanReport, TransportEvent,
    TransportEventSender, TransportHandle, TransportStatus, WriteMode,
};
use crate::advertisement;
use crate::error::TransportError;
use crate::identifier::PeripheralAddress;
use crate::model::{CharacteristicNode, DescriptorNode, ServiceNode};

/// Transport backend on the first available system adapter.
#[derive(Debug)]
pub struct BtleplugBackend {
    adapter: Adapter,
    events: TransportEventSender,
    inner: Mutex<BackendState>,
}

#[derive(Debug)]
struct BackendState {
    next_handle: u64,
    connections: HashMap<u64, ConnectionEntry>,
    scan_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ConnectionEntry {
    address: PeripheralAddress,
    peripheral: Peripheral,
    watch_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl BtleplugBackend {
    /// Creates the backend on the first adapter reported by the platform.
    pub async fn new(events: TransportEventSender) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Err(TransportError::NoAdapters);
        };
        info!(adapter = %adapter.adapter_info().await?, "bluetooth adapter ready");

        Ok(Self {
            adapter,
            events,
            inner: Mutex::new(BackendState {
                next_handle: 0,
                connections: HashMap::new(),
                scan_task: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, handle: TransportHandle) -> Result<(PeripheralAddress, Peripheral), TransportError> {
        let state = self.lock();
        let entry = state
            .connections
            .get(&handle.raw())
            .ok_or(TransportError::UnknownHandle { handle })?;
        Ok((entry.address.clone(), entry.peripheral.clone()))
    }

    async fn peripheral_by_address(
        &self,
        address: &PeripheralAddress,
    ) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if &PeripheralAddress::new(peripheral.address().to_string()) == address {
                return Ok(peripheral);
            }
        }
        Err(TransportError::UnknownPeripheral {
            address: address.clone(),
        })
    }
}

#[async_trait]
impl PeripheralTransport for BtleplugBackend {
    #[instrument(skip(self), level = "debug", fields(%address))]
    async fn connect(
        &self,
        address: &PeripheralAddress,
    ) -> Result<TransportHandle, TransportError> {
        let peripheral = self.peripheral_by_address(address).await?;

        let watch_task = {
            let events = self.events.clone();
            let adapter = self.adapter.clone();
            let address = address.clone();
            let peripheral_id = peripheral.id();
            tokio::spawn(async move {
                watch_link(adapter, peripheral_id, address, events).await;
            })
        };
        let notify_task = {
            let events = self.events.clone();
            let address = address.clone();
            let peripheral = peripheral.clone();
            tokio::spawn(async move {
                pump_notifications(peripheral, address, events).await;
            })
        };

        let handle = {
            let mut state = self.lock();
            state.next_handle += 1;
            let handle = TransportHandle::new(state.next_handle);
            state.connections.insert(
                handle.raw(),
                ConnectionEntry {
                    address: address.clone(),
                    peripheral: peripheral.clone(),
                    watch_task: Some(watch_task),
                    notify_task: Some(notify_task),
                },
            );
            handle
        };

        let events = self.events.clone();
        let address = address.clone();
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => forward(
                    &events,
                    TransportEvent::ConnectionState {
                        address,
                        state: LinkState::Connected,
                        status: TransportStatus::Success,
                    },
                ),
                Err(error) => {
                    warn!(%address, ?error, "connect attempt failed");
                    forward(
                        &events,
                        TransportEvent::ConnectionState {
                            address,
                            state: LinkState::Disconnected,
                            status: TransportStatus::Failure,
                        },
                    );
                }
            }
        });
        Ok(handle)
    }

    #[instrument(skip(self), level = "debug", fields(%handle))]
    async fn disconnect(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, peripheral) = {
            let mut state = self.lock();
            let entry = state
                .connections
                .get_mut(&handle.raw())
                .ok_or(TransportError::UnknownHandle { handle })?;
            // An orderly teardown reports through the disconnect future,
            // not the adapter's disconnect notification.
            if let Some(watch) = entry.watch_task.take() {
                watch.abort();
            }
            (entry.address.clone(), entry.peripheral.clone())
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let status = match peripheral.disconnect().await {
                Ok(()) => TransportStatus::Success,
                Err(error) => {
                    warn!(%address, ?error, "disconnect attempt failed");
                    TransportStatus::Failure
                }
            };
            forward(
                &events,
                TransportEvent::ConnectionState {
                    address,
                    state: LinkState::Disconnected,
                    status,
                },
            );
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%handle))]
    async fn discover_services(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = collect_service_tree(&peripheral);
                    forward(
                        &events,
                        TransportEvent::ServicesDiscovered {
                            address,
                            services,
                            status: TransportStatus::Success,
                        },
                    );
                }
                Err(error) => {
                    warn!(%address, ?error, "service discovery failed");
                    forward(
                        &events,
                        TransportEvent::ServicesDiscovered {
                            address,
                            services: Vec::new(),
                            status: TransportStatus::Failure,
                        },
                    );
                }
            }
        });
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%handle, %characteristic))]
    async fn read_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let (value, status) = match peripheral.read(&target).await {
                Ok(value) => (value, TransportStatus::Success),
                Err(error) => {
                    debug!(%address, ?error, "characteristic read failed");
                    (Vec::new(), TransportStatus::Failure)
                }
            };
            forward(
                &events,
                TransportEvent::CharacteristicRead {
                    address,
                    service,
                    characteristic,
                    value,
                    status,
                },
            );
        });
        Ok(())
    }

    #[instrument(
        skip(self, payload),
        level = "trace",
        fields(%handle, %characteristic, ?mode, payload_len = payload.len())
    )]
    async fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let payload = payload.to_vec();
        let events = self.events.clone();
        tokio::spawn(async move {
            match peripheral.write(&target, &payload, write_type).await {
                Ok(()) if mode == WriteMode::WithResponse => forward(
                    &events,
                    TransportEvent::CharacteristicWritten {
                        address,
                        service,
                        characteristic,
                        status: TransportStatus::Success,
                    },
                ),
                Ok(()) => {}
                Err(error) => {
                    debug!(%address, ?error, "characteristic write failed");
                    forward(
                        &events,
                        TransportEvent::CharacteristicWritten {
                            address,
                            service,
                            characteristic,
                            status: TransportStatus::Failure,
                        },
                    );
                }
            }
        });
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%handle, %descriptor))]
    async fn read_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let target = find_descriptor(&peripheral, service, characteristic, descriptor)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let (value, status) = match peripheral.read_descriptor(&target).await {
                Ok(value) => (value, TransportStatus::Success),
                Err(error) => {
                    debug!(%address, ?error, "descriptor read failed");
                    (Vec::new(), TransportStatus::Failure)
                }
            };
            forward(
                &events,
                TransportEvent::DescriptorRead {
                    address,
                    service,
                    characteristic,
                    descriptor,
                    value,
                    status,
                },
            );
        });
        Ok(())
    }

    #[instrument(
        skip(self, payload),
        level = "trace",
        fields(%handle, %descriptor, payload_len = payload.len())
    )]
    async fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let target = find_descriptor(&peripheral, service, characteristic, descriptor)?;
        let payload = payload.to_vec();
        let events = self.events.clone();
        tokio::spawn(async move {
            let status = match peripheral.write_descriptor(&target, &payload).await {
                Ok(()) => TransportStatus::Success,
                Err(error) => {
                    debug!(%address, ?error, "descriptor write failed");
                    TransportStatus::Failure
                }
            };
            forward(
                &events,
                TransportEvent::DescriptorWritten {
                    address,
                    service,
                    characteristic,
                    descriptor,
                    status,
                },
            );
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%handle, %characteristic, enable))]
    async fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), TransportError> {
        let (_address, peripheral) = self.entry(handle)?;
        let target = find_characteristic(&peripheral, service, characteristic)?;
        if enable {
            peripheral.subscribe(&target).await?;
        } else {
            peripheral.unsubscribe(&target).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%handle))]
    async fn read_signal_strength(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let (address, peripheral) = self.entry(handle)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let (rssi, status) = match peripheral.properties().await {
                Ok(Some(properties)) => (properties.rssi, TransportStatus::Success),
                Ok(None) => (None, TransportStatus::Failure),
                Err(error) => {
                    debug!(%address, ?error, "signal strength read failed");
                    (None, TransportStatus::Failure)
                }
            };
            forward(
                &events,
                TransportEvent::SignalStrength {
                    address,
                    rssi,
                    status,
                },
            );
        });
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%handle))]
    async fn release(&self, handle: TransportHandle) {
        let entry = self.lock().connections.remove(&handle.raw());
        let Some(entry) = entry else {
            debug!(%handle, "release for unknown handle");
            return;
        };
        if let Some(task) = entry.watch_task {
            task.abort();
        }
        if let Some(task) = entry.notify_task {
            task.abort();
        }
    }
}

#[async_trait]
impl DiscoveryScanner for BtleplugBackend {
    #[instrument(skip(self), level = "debug")]
    async fn start(
        &self,
        duplicates_allowed: bool,
    ) -> Result<mpsc::UnboundedReceiver<ScanReport>, TransportError> {
        let mut adapter_events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) => id,
                    CentralEvent::DeviceUpdated(id) if duplicates_allowed => id,
                    _ => continue,
                };
                let Some(report) = scan_report(&adapter, &id).await else {
                    continue;
                };
                if sender.send(report).is_err() {
                    return;
                }
            }
        });
        self.lock().scan_task = Some(task);
        Ok(receiver)
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(task) = self.lock().scan_task.take() {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

fn forward(events: &TransportEventSender, event: TransportEvent) {
    if events.send(event).is_err() {
        debug!("transport event receiver dropped");
    }
}

async fn watch_link(
    adapter: Adapter,
    peripheral_id: PeripheralId,
    address: PeripheralAddress,
    events: TransportEventSender,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(%address, ?error, "failed to watch adapter events");
            return;
        }
    };
    while let Some(event) = stream.next().await {
        if let CentralEvent::DeviceDisconnected(id) = event
            && id == peripheral_id
        {
            forward(
                &events,
                TransportEvent::ConnectionState {
                    address: address.clone(),
                    state: LinkState::Disconnected,
                    status: TransportStatus::LinkLoss,
                },
            );
        }
    }
}

async fn pump_notifications(
    peripheral: Peripheral,
    address: PeripheralAddress,
    events: TransportEventSender,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(%address, ?error, "failed to open notification stream");
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let Some(service) = owning_service(&peripheral, notification.uuid) else {
            debug!(
                %address,
                characteristic = %notification.uuid,
                "dropping notification for undiscovered characteristic"
            );
            continue;
        };
        forward(
            &events,
            TransportEvent::CharacteristicChanged {
                address: address.clone(),
                service,
                characteristic: notification.uuid,
                value: notification.value,
            },
        );
    }
}

fn owning_service(peripheral: &Peripheral, characteristic: Uuid) -> Option<Uuid> {
    peripheral
        .services()
        .iter()
        .find(|service| {
            service
                .characteristics
                .iter()
                .any(|candidate| candidate.uuid == characteristic)
        })
        .map(|service| service.uuid)
}

fn find_characteristic(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .services()
        .iter()
        .find(|candidate| candidate.uuid == service)
        .and_then(|candidate| {
            candidate
                .characteristics
                .iter()
                .find(|node| node.uuid == characteristic)
                .cloned()
        })
        .ok_or(TransportError::UnknownAttribute {
            uuid: characteristic,
        })
}

fn find_descriptor(
    peripheral: &Peripheral,
    service: Uuid,
    characteristic: Uuid,
    descriptor: Uuid,
) -> Result<Descriptor, TransportError> {
    let target = find_characteristic(peripheral, service, characteristic)?;
    target
        .descriptors
        .iter()
        .find(|node| node.uuid == descriptor)
        .cloned()
        .ok_or(TransportError::UnknownAttribute { uuid: descriptor })
}

async fn scan_report(adapter: &Adapter, id: &PeripheralId) -> Option<ScanReport> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok().flatten()?;
    let address = PeripheralAddress::new(peripheral.address().to_string());

    // btleplug surfaces pre-parsed advertisement fields; re-encode them so
    // downstream consumers see one payload format regardless of backend.
    let mut advertisement = advertisement::encode_service_uuids(&properties.services);
    if let Some(name) = properties.local_name.as_deref() {
        advertisement.extend_from_slice(&advertisement::encode_local_name(name));
    }

    Some(ScanReport::new(
        address,
        properties.local_name,
        properties.rssi,
        advertisement,
    ))
}

fn collect_service_tree(peripheral: &Peripheral) -> Vec<ServiceNode> {
    let mut services = Vec::new();
    for service in peripheral.services() {
        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|descriptor| DescriptorNode::new(descriptor.uuid))
                .collect();
            characteristics.push(CharacteristicNode::new(
                characteristic.uuid,
                property_labels(characteristic.properties),
                descriptors,
            ));
        }
        services.push(ServiceNode::new(
            service.uuid,
            service.primary,
            characteristics,
        ));
    }
    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect()
}
