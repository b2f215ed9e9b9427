//! Connection state machine and the registry of live sessions.

use crate::identifier::PeripheralAddress;
use crate::model::ServiceNode;
use crate::transport::TransportHandle;

/// Lifecycle states of one peripheral session. A session is created in
/// `Connecting`; the absence of a session is the idle state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum SessionState {
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("services_discovering")]
    ServicesDiscovering,
    #[display("services_ready")]
    ServicesReady,
    #[display("disconnecting")]
    Disconnecting,
    #[display("failed")]
    Failed,
    #[display("closed")]
    Closed,
}

impl SessionState {
    /// Returns whether no further operations may target the session.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Returns whether service discovery may be issued from this state.
    pub(crate) fn may_discover_services(self) -> bool {
        matches!(self, Self::Connected | Self::ServicesReady)
    }
}

/// One connected peripheral: its transport handle, lifecycle state and the
/// service tree populated by discovery.
#[derive(Debug)]
pub struct ConnectionSession {
    address: PeripheralAddress,
    local_name: Option<String>,
    handle: TransportHandle,
    state: SessionState,
    services: Vec<ServiceNode>,
    handle_released: bool,
}

impl ConnectionSession {
    pub(crate) fn new(
        address: PeripheralAddress,
        local_name: Option<String>,
        handle: TransportHandle,
    ) -> Self {
        Self {
            address,
            local_name,
            handle,
            state: SessionState::Connecting,
            services: Vec::new(),
            handle_released: false,
        }
    }

    /// Returns the peripheral address.
    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Returns the advertised name captured at connect time.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the transport handle owned by this session.
    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        self.handle
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the discovered service tree; empty before discovery.
    #[must_use]
    pub fn services(&self) -> &[ServiceNode] {
        &self.services
    }

    /// Takes ownership of the transport handle for release. Subsequent
    /// calls return `None`, which makes racing teardown paths release the
    /// handle at most once.
    pub(crate) fn take_handle(&mut self) -> Option<TransportHandle> {
        if self.handle_released {
            return None;
        }
        self.handle_released = true;
        Some(self.handle)
    }

    /// Records the transport's connection confirmation. Returns `false`
    /// when the session is not waiting for one.
    pub(crate) fn mark_connected(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.state = SessionState::Connected;
        true
    }

    /// Enters service discovery. Returns `false` when the current state
    /// does not permit it.
    pub(crate) fn begin_service_discovery(&mut self) -> bool {
        if !self.state.may_discover_services() {
            return false;
        }
        self.state = SessionState::ServicesDiscovering;
        true
    }

    /// Reverts a service discovery whose transport request was refused.
    pub(crate) fn cancel_service_discovery(&mut self) {
        if self.state == SessionState::ServicesDiscovering {
            self.state = SessionState::Connected;
        }
    }

    /// Stores the discovered tree and marks the session ready.
    pub(crate) fn complete_service_discovery(&mut self, services: Vec<ServiceNode>) {
        self.services = services;
        self.state = SessionState::ServicesReady;
    }

    /// Marks the session terminal as it leaves the registry; `Failed`
    /// for connection failures, `Closed` otherwise.
    pub(crate) fn finish(&mut self, state: SessionState) {
        if state.is_terminal() {
            self.state = state;
        }
    }

    /// Enters teardown. Returns `false` when a disconnect is already in
    /// flight or the session is terminal, making repeated requests no-ops.
    pub(crate) fn begin_disconnect(&mut self) -> bool {
        if self.state == SessionState::Disconnecting || self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Disconnecting;
        true
    }
}

/// Insertion-ordered set of live sessions, keyed by peripheral address.
///
/// Iteration order is the order sessions were created in, which makes
/// cross-session attribute resolution deterministic. A given address is
/// present at most once.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<ConnectionSession>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a session, replacing any existing session for the same
    /// address in place so iteration order is preserved.
    pub(crate) fn insert(&mut self, session: ConnectionSession) {
        match self.position(session.address()) {
            Some(index) => self.sessions[index] = session,
            None => self.sessions.push(session),
        }
    }

    /// Returns the session for an address, if one exists.
    #[must_use]
    pub fn get(&self, address: &PeripheralAddress) -> Option<&ConnectionSession> {
        self.position(address).map(|index| &self.sessions[index])
    }

    pub(crate) fn get_mut(&mut self, address: &PeripheralAddress) -> Option<&mut ConnectionSession> {
        self.position(address)
            .map(|index| &mut self.sessions[index])
    }

    /// Removes and returns the session for an address.
    pub(crate) fn remove(&mut self, address: &PeripheralAddress) -> Option<ConnectionSession> {
        self.position(address).map(|index| self.sessions.remove(index))
    }

    /// Removes and returns every session, for shutdown sweeps.
    pub(crate) fn drain(&mut self) -> Vec<ConnectionSession> {
        std::mem::take(&mut self.sessions)
    }

    /// Iterates sessions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionSession> {
        self.sessions.iter()
    }

    /// Returns the number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether no sessions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn position(&self, address: &PeripheralAddress) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.address() == address)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn session(address: &str, handle: u64) -> ConnectionSession {
        ConnectionSession::new(
            PeripheralAddress::new(address),
            None,
            TransportHandle::new(handle),
        )
    }

    #[test]
    fn insert_replaces_existing_address_in_place() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("aa:bb:cc", 1));
        registry.insert(session("dd:ee:ff", 2));
        registry.insert(session("AA:BB:CC", 3));

        let handles: Vec<u64> = registry
            .iter()
            .map(|session| session.handle().raw())
            .collect();
        assert_eq!(vec![3, 2], handles);
        assert_eq!(2, registry.len());
    }

    #[test]
    fn take_handle_yields_exactly_once() {
        let mut session = session("aa:bb:cc", 7);
        assert_eq!(Some(TransportHandle::new(7)), session.take_handle());
        assert_eq!(None, session.take_handle());
        assert_eq!(None, session.take_handle());
    }

    #[test]
    fn begin_disconnect_is_idempotent() {
        let mut session = session("aa:bb:cc", 1);
        assert!(session.begin_disconnect());
        assert!(!session.begin_disconnect());
        assert_eq!(SessionState::Disconnecting, session.state());
    }

    #[rstest]
    #[case(SessionState::Connecting, false)]
    #[case(SessionState::Connected, true)]
    #[case(SessionState::ServicesReady, true)]
    #[case(SessionState::Disconnecting, false)]
    fn service_discovery_requires_a_settled_connection(
        #[case] state: SessionState,
        #[case] permitted: bool,
    ) {
        let mut session = session("aa:bb:cc", 1);
        session.state = state;
        assert_eq!(permitted, session.begin_service_discovery());
    }

    #[test]
    fn mark_connected_only_confirms_pending_connects() {
        let mut session = session("aa:bb:cc", 1);
        assert!(session.mark_connected());
        assert!(!session.mark_connected());
        assert_eq!(SessionState::Connected, session.state());
    }
}
