pub(crate) mod command;
pub(crate) mod inspect;
pub(crate) mod listen;
pub(crate) mod scan;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio::time::timeout_at;

pub use self::command::{Args, Command, FakeArgs, InspectArgs, ListenArgs, OutputFormat, ScanArgs};
use crate::error::ErrorKind;
use crate::event::{AttributeValue, DeviceEventListener};
use crate::identifier::PeripheralAddress;
use crate::model::{DiscoveredPeripheral, ServiceNode};
use crate::transport::TransportStatus;

/// Session events the command loops act on, forwarded out of the
/// synchronous listener fan-out.
#[derive(Debug, Clone)]
pub(crate) enum CliEvent {
    PeripheralFound(DiscoveredPeripheral),
    Connected {
        address: PeripheralAddress,
    },
    Disconnected {
        address: PeripheralAddress,
    },
    ConnectionFailure {
        address: PeripheralAddress,
        status: TransportStatus,
    },
    UnexpectedDisconnection {
        address: PeripheralAddress,
        status: TransportStatus,
    },
    ServicesDiscovered {
        address: PeripheralAddress,
        services: Vec<ServiceNode>,
    },
    CharacteristicChanged {
        characteristic: String,
        value: Vec<u8>,
    },
    Error(ErrorKind),
    NoConnectedDevices,
}

/// Listener that forwards session events into a channel the command
/// loops can await on.
pub(crate) struct EventBridge {
    sender: mpsc::UnboundedSender<CliEvent>,
}

impl EventBridge {
    pub(crate) fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<CliEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }

    fn forward(&self, event: CliEvent) {
        let _ = self.sender.send(event);
    }
}

impl DeviceEventListener for EventBridge {
    fn on_peripheral_found(&self, peripheral: &DiscoveredPeripheral) {
        self.forward(CliEvent::PeripheralFound(peripheral.clone()));
    }

    fn on_device_connected(&self, _name: Option<&str>, address: &PeripheralAddress) {
        self.forward(CliEvent::Connected {
            address: address.clone(),
        });
    }

    fn on_device_disconnected(&self, _name: Option<&str>, address: &PeripheralAddress) {
        self.forward(CliEvent::Disconnected {
            address: address.clone(),
        });
    }

    fn on_connection_failure(
        &self,
        _name: Option<&str>,
        address: &PeripheralAddress,
        status: TransportStatus,
    ) {
        self.forward(CliEvent::ConnectionFailure {
            address: address.clone(),
            status,
        });
    }

    fn on_unexpected_disconnection(
        &self,
        _name: Option<&str>,
        address: &PeripheralAddress,
        status: TransportStatus,
    ) {
        self.forward(CliEvent::UnexpectedDisconnection {
            address: address.clone(),
            status,
        });
    }

    fn on_services_discovered(
        &self,
        address: &PeripheralAddress,
        services: &[ServiceNode],
        _status: TransportStatus,
    ) {
        self.forward(CliEvent::ServicesDiscovered {
            address: address.clone(),
            services: services.to_vec(),
        });
    }

    fn on_characteristic_changed(&self, change: &AttributeValue) {
        self.forward(CliEvent::CharacteristicChanged {
            characteristic: change.characteristic.clone(),
            value: change.value.clone(),
        });
    }

    fn on_no_connected_devices(&self) {
        self.forward(CliEvent::NoConnectedDevices);
    }

    fn on_error(&self, error: ErrorKind) {
        self.forward(CliEvent::Error(error));
    }
}

/// Awaits the first event the matcher accepts. The matcher returns
/// `Ok(Some(..))` to finish, `Ok(None)` to keep waiting and `Err` to
/// abort the command.
pub(crate) async fn wait_for_event<T>(
    events: &mut mpsc::UnboundedReceiver<CliEvent>,
    wait: Duration,
    mut matcher: impl FnMut(CliEvent) -> Result<Option<T>>,
) -> Result<T> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let Ok(received) = timeout_at(deadline, events.recv()).await else {
            bail!("timed out waiting for a session event");
        };
        let Some(event) = received else {
            bail!("session event stream closed");
        };
        if let Some(matched) = matcher(event)? {
            return Ok(matched);
        }
    }
}

/// Formats bytes as upper-case hexadecimal pairs separated by spaces.
pub(crate) fn format_payload(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }
    let rendered = hex::encode_upper(bytes);
    let mut spaced = String::with_capacity(rendered.len() + rendered.len() / 2);
    for (index, pair) in rendered.as_bytes().chunks(2).enumerate() {
        if index > 0 {
            spaced.push(' ');
        }
        spaced.push_str(&String::from_utf8_lossy(pair));
    }
    spaced
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn format_payload_handles_empty_input() {
        assert_eq!("<empty>", format_payload(&[]));
    }

    #[test]
    fn format_payload_spaces_upper_case_pairs() {
        assert_eq!("05 00 A1 FF", format_payload(&[0x05, 0x00, 0xA1, 0xFF]));
    }

    #[test]
    fn format_rssi_handles_unknown() {
        assert_eq!("-", format_rssi(None));
        assert_eq!("-43 dBm", format_rssi(Some(-43)));
    }
}
