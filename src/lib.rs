pub mod advertisement;
mod app;
mod cli;
mod error;
mod event;
mod identifier;
mod manager;
mod model;
mod resolver;
mod session;
mod telemetry;
mod transport;

pub use app::run;
pub use cli::{Args, Command, FakeArgs, InspectArgs, ListenArgs, OutputFormat, ScanArgs};
pub use error::{ErrorKind, FixtureError, TelemetryError, TransportError};
pub use event::{
    AttributeValue, AttributeWrite, DescriptorValue, DescriptorWrite, DeviceEventListener,
};
pub use identifier::{
    CCC_DESCRIPTOR_UUID, IdentifierError, PeripheralAddress, canonical_uuid, expand_short_uuid,
    parse_attribute_uuid, short_form,
};
pub use manager::SessionManager;
pub use model::{
    CharacteristicNode, DISABLE_NOTIFICATION_VALUE, DescriptorNode, DiscoveredPeripheral,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, ServiceNode, ServiceState,
};
pub use resolver::{AttributeKind, ResolveError};
pub use session::{ConnectionSession, SessionRegistry, SessionState};
pub use transport::{
    BtleplugBackend, DiscoveryScanner, FakeBackend, FakeBackendConfig, FakePeripheral, LinkState,
    NotificationPayloads, PeripheralTransport, RecordedDescriptorWrite, RecordedWrite, ScanFixture,
    ScanReport, TransportBackend, TransportEvent, TransportEventReceiver, TransportEventSender,
    TransportHandle, TransportStatus, WriteMode, backend_clients, event_channel,
};
