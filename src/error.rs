use thiserror::Error;
use uuid::Uuid;

use crate::identifier::PeripheralAddress;
use crate::transport::TransportHandle;

/// Error kinds reported to listeners through the error event.
///
/// Commands never return these; every failure is classified and fanned out
/// so callers observe errors the same way they observe completions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, strum_macros::Display)]
pub enum ErrorKind {
    /// No connected peripheral owns the requested identifier.
    #[strum(to_string = "device_not_found")]
    DeviceNotFound,
    /// Connected peripherals exist but none exposes the service.
    #[strum(to_string = "device_service_not_found")]
    DeviceServiceNotFound,
    /// Connected peripherals exist but none exposes the characteristic.
    #[strum(to_string = "device_attributes_not_found")]
    DeviceAttributesNotFound,
    /// The characteristic exists but the descriptor does not.
    #[strum(to_string = "attribute_descriptor_not_found")]
    AttributeDescriptorNotFound,
    /// The transport refused to queue a characteristic read.
    #[strum(to_string = "attribute_read_failed")]
    AttributeReadFailed,
    /// The transport refused to queue a characteristic write.
    #[strum(to_string = "attribute_write_failed")]
    AttributeWriteFailed,
    /// The transport refused to queue a descriptor read.
    #[strum(to_string = "attribute_descriptor_read_failed")]
    AttributeDescriptorReadFailed,
    /// The transport refused to queue a descriptor write.
    #[strum(to_string = "attribute_descriptor_write_failed")]
    AttributeDescriptorWriteFailed,
    /// The transport refused to toggle notification delivery.
    #[strum(to_string = "attribute_notification_failed")]
    AttributeNotificationFailed,
}

/// Errors returned synchronously by transport and scanner backends when a
/// request cannot be queued. Completions of queued requests arrive as
/// transport events instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{address}` is not known to the transport")]
    UnknownPeripheral { address: PeripheralAddress },
    #[error("transport handle {handle} is not active")]
    UnknownHandle { handle: TransportHandle },
    #[error("attribute {uuid} was not found on the connected peripheral")]
    UnknownAttribute { uuid: Uuid },
    #[error("the transport refused to queue the operation")]
    Busy,
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Errors returned when parsing fake-backend fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake scan fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("failed to parse hexadecimal payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
