//! Listener contract and synchronous event fan-out.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::ErrorKind;
use crate::identifier::PeripheralAddress;
use crate::model::{CharacteristicNode, DescriptorNode, DiscoveredPeripheral, ServiceNode};
use crate::transport::TransportStatus;

/// A characteristic value carried by a read, change or notification event.
/// UUIDs are upper-cased canonical strings.
#[derive(Debug, Clone)]
pub struct AttributeValue {
    pub address: PeripheralAddress,
    pub service: String,
    pub characteristic: String,
    pub value: Vec<u8>,
    pub status: TransportStatus,
}

/// A characteristic write completion.
#[derive(Debug, Clone)]
pub struct AttributeWrite {
    pub address: PeripheralAddress,
    pub service: String,
    pub characteristic: String,
    pub status: TransportStatus,
}

/// A descriptor value carried by a descriptor read event.
#[derive(Debug, Clone)]
pub struct DescriptorValue {
    pub address: PeripheralAddress,
    pub service: String,
    pub characteristic: String,
    pub descriptor: String,
    pub value: Vec<u8>,
    pub status: TransportStatus,
}

/// A descriptor write completion.
#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub address: PeripheralAddress,
    pub service: String,
    pub characteristic: String,
    pub descriptor: String,
    pub status: TransportStatus,
}

/// Observer of normalized session events.
///
/// Every method has a default no-op body so implementations subscribe to
/// the event kinds they care about. Callbacks run synchronously on the
/// task that produced the event; implementations should hand work off
/// rather than block.
pub trait DeviceEventListener: Send + Sync {
    /// A peripheral was seen (or refreshed) during discovery.
    fn on_peripheral_found(&self, _peripheral: &DiscoveredPeripheral) {}

    /// A connection request completed successfully.
    fn on_device_connected(&self, _name: Option<&str>, _address: &PeripheralAddress) {}

    /// A session ended through an explicit or peer-acknowledged disconnect.
    fn on_device_disconnected(&self, _name: Option<&str>, _address: &PeripheralAddress) {}

    /// A connection attempt or established link failed outright.
    fn on_connection_failure(
        &self,
        _name: Option<&str>,
        _address: &PeripheralAddress,
        _status: TransportStatus,
    ) {
    }

    /// An established link was lost without an explicit disconnect.
    fn on_unexpected_disconnection(
        &self,
        _name: Option<&str>,
        _address: &PeripheralAddress,
        _status: TransportStatus,
    ) {
    }

    /// Service discovery completed; the status is forwarded as reported.
    fn on_services_discovered(
        &self,
        _address: &PeripheralAddress,
        _services: &[ServiceNode],
        _status: TransportStatus,
    ) {
    }

    /// A service listing resolved to its characteristics.
    fn on_service_characteristics(
        &self,
        _address: &PeripheralAddress,
        _service: &str,
        _characteristics: &[CharacteristicNode],
    ) {
    }

    /// A characteristic listing resolved to its descriptors.
    fn on_characteristic_descriptors(
        &self,
        _address: &PeripheralAddress,
        _service: &str,
        _characteristic: &str,
        _descriptors: &[DescriptorNode],
    ) {
    }

    /// An asynchronous characteristic read completed.
    fn on_characteristic_read(&self, _read: &AttributeValue) {}

    /// An acknowledged characteristic write completed.
    fn on_characteristic_written(&self, _write: &AttributeWrite) {}

    /// The peripheral pushed a value change.
    fn on_characteristic_changed(&self, _change: &AttributeValue) {}

    /// An asynchronous descriptor read completed.
    fn on_descriptor_read(&self, _read: &DescriptorValue) {}

    /// A descriptor write completed.
    fn on_descriptor_written(&self, _write: &DescriptorWrite) {}

    /// Synthetic acknowledgment for a write issued without response; the
    /// transport will not confirm these, so the session manager does.
    fn on_write_without_response(&self, _write: &AttributeWrite) {}

    /// An RSSI read completed.
    fn on_signal_strength(
        &self,
        _address: &PeripheralAddress,
        _name: Option<&str>,
        _rssi: Option<i16>,
        _status: TransportStatus,
    ) {
    }

    /// An attribute command was issued while no peripheral is connected.
    fn on_no_connected_devices(&self) {}

    /// A command failed; the kind identifies what went wrong.
    fn on_error(&self, _error: ErrorKind) {}
}

/// Registry of listeners dispatched to in registration order.
///
/// Dispatch iterates over a snapshot copy, so listeners may register or
/// deregister from within a callback without disturbing the round that is
/// already in flight.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn DeviceEventListener>>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a listener to the dispatch order.
    pub(crate) fn register(&self, listener: Arc<dyn DeviceEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Removes a listener by identity.
    pub(crate) fn deregister(&self, listener: &Arc<dyn DeviceEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    /// Invokes `notify` once per registered listener, in registration order.
    pub(crate) fn notify_each(&self, notify: impl Fn(&dyn DeviceEventListener)) {
        let snapshot: Vec<Arc<dyn DeviceEventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            notify(listener.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DeviceEventListener for Recorder {
        fn on_no_connected_devices(&self) {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.label);
        }
    }

    #[test]
    fn dispatch_follows_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            registry.register(Arc::new(Recorder {
                label,
                seen: Arc::clone(&seen),
            }));
        }

        registry.notify_each(|listener| listener.on_no_connected_devices());

        let order = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(vec!["first", "second", "third"], order);
    }

    #[test]
    fn deregistered_listener_no_longer_receives_events() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn DeviceEventListener> = Arc::new(Recorder {
            label: "only",
            seen: Arc::clone(&seen),
        });
        registry.register(Arc::clone(&listener));
        registry.deregister(&listener);

        registry.notify_each(|candidate| candidate.on_no_connected_devices());

        assert_eq!(
            0,
            seen.lock().unwrap_or_else(PoisonError::into_inner).len()
        );
    }

    struct SelfRemover {
        registry: Arc<ListenerRegistry>,
        this: Mutex<Option<Arc<dyn DeviceEventListener>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl DeviceEventListener for SelfRemover {
        fn on_no_connected_devices(&self) {
            *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            if let Some(this) = self
                .this
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                self.registry.deregister(&this);
            }
        }
    }

    #[test]
    fn deregistration_during_dispatch_is_safe() {
        let registry = Arc::new(ListenerRegistry::new());
        let calls = Arc::new(Mutex::new(0usize));
        let remover = Arc::new(SelfRemover {
            registry: Arc::clone(&registry),
            this: Mutex::new(None),
            calls: Arc::clone(&calls),
        });
        let as_listener: Arc<dyn DeviceEventListener> = remover.clone();
        *remover.this.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&as_listener));
        registry.register(as_listener);

        registry.notify_each(|listener| listener.on_no_connected_devices());
        registry.notify_each(|listener| listener.on_no_connected_devices());

        assert_eq!(1, *calls.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
