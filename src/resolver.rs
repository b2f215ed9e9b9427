//! Cross-session attribute resolution.
//!
//! Attribute UUIDs are unique within their parent but not across
//! peripherals, so a bare UUID can match several connected sessions. All
//! lookups scan sessions in registry insertion order and return the first
//! match, which keeps repeated resolutions stable while the session set is
//! unchanged.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{CharacteristicNode, DescriptorNode, ServiceNode};
use crate::session::{ConnectionSession, SessionRegistry};

/// The GATT attribute categories a lookup can target.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum AttributeKind {
    #[strum(to_string = "service")]
    Service,
    #[strum(to_string = "characteristic")]
    Characteristic,
    #[strum(to_string = "descriptor")]
    Descriptor,
}

/// Errors returned by attribute resolution.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ResolveError {
    #[error("no connected peripheral exposes {kind} {uuid}")]
    NotFound { kind: AttributeKind, uuid: Uuid },
    #[error("descriptor {uuid} repeats across characteristics and needs a parent to disambiguate")]
    AmbiguousParentRequired { uuid: Uuid },
}

/// A service resolved to its owning session.
pub(crate) struct ServiceMatch<'a> {
    pub(crate) session: &'a ConnectionSession,
    pub(crate) service: &'a ServiceNode,
}

/// A characteristic resolved to its owning session and service.
pub(crate) struct CharacteristicMatch<'a> {
    pub(crate) session: &'a ConnectionSession,
    pub(crate) service: &'a ServiceNode,
    pub(crate) characteristic: &'a CharacteristicNode,
}

/// A descriptor resolved within its parent characteristic.
pub(crate) struct DescriptorMatch<'a> {
    pub(crate) session: &'a ConnectionSession,
    pub(crate) service: &'a ServiceNode,
    pub(crate) characteristic: &'a CharacteristicNode,
    pub(crate) descriptor: &'a DescriptorNode,
}

/// Finds the first session exposing the service.
pub(crate) fn find_service(
    sessions: &SessionRegistry,
    uuid: Uuid,
) -> Result<ServiceMatch<'_>, ResolveError> {
    sessions
        .iter()
        .find_map(|session| {
            session
                .services()
                .iter()
                .find(|service| service.uuid() == uuid)
                .map(|service| ServiceMatch { session, service })
        })
        .ok_or(ResolveError::NotFound {
            kind: AttributeKind::Service,
            uuid,
        })
}

/// Finds the first session exposing the characteristic.
pub(crate) fn find_characteristic(
    sessions: &SessionRegistry,
    uuid: Uuid,
) -> Result<CharacteristicMatch<'_>, ResolveError> {
    sessions
        .iter()
        .find_map(|session| {
            session.services().iter().find_map(|service| {
                service
                    .find_characteristic(uuid)
                    .map(|characteristic| CharacteristicMatch {
                        session,
                        service,
                        characteristic,
                    })
            })
        })
        .ok_or(ResolveError::NotFound {
            kind: AttributeKind::Characteristic,
            uuid,
        })
}

/// Finds a descriptor within its parent characteristic.
///
/// Descriptor UUIDs repeat across characteristics (the CCC descriptor is
/// on every notifying characteristic), so the parent is mandatory; a
/// lookup without one fails rather than guessing.
pub(crate) fn find_descriptor(
    sessions: &SessionRegistry,
    uuid: Uuid,
    parent_characteristic: Option<Uuid>,
) -> Result<DescriptorMatch<'_>, ResolveError> {
    let Some(parent) = parent_characteristic else {
        return Err(ResolveError::AmbiguousParentRequired { uuid });
    };

    let found = find_characteristic(sessions, parent)?;
    let descriptor =
        found
            .characteristic
            .find_descriptor(uuid)
            .ok_or(ResolveError::NotFound {
                kind: AttributeKind::Descriptor,
                uuid,
            })?;
    Ok(DescriptorMatch {
        session: found.session,
        service: found.service,
        characteristic: found.characteristic,
        descriptor,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::identifier::{CCC_DESCRIPTOR_UUID, PeripheralAddress, expand_short_uuid};
    use crate::model::{CharacteristicNode, DescriptorNode, ServiceNode};
    use crate::session::ConnectionSession;
    use crate::transport::TransportHandle;

    fn heart_rate_tree() -> Vec<ServiceNode> {
        vec![ServiceNode::new(
            expand_short_uuid(0x180D),
            true,
            vec![CharacteristicNode::new(
                expand_short_uuid(0x2A37),
                vec!["notify".to_string()],
                vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
            )],
        )]
    }

    fn ready_session(address: &str, handle: u64, services: Vec<ServiceNode>) -> ConnectionSession {
        let mut session = ConnectionSession::new(
            PeripheralAddress::new(address),
            None,
            TransportHandle::new(handle),
        );
        session.mark_connected();
        session.begin_service_discovery();
        session.complete_service_discovery(services);
        session
    }

    fn two_sessions_with_shared_uuids() -> SessionRegistry {
        let mut registry = SessionRegistry::new();
        registry.insert(ready_session("aa:bb:cc", 1, heart_rate_tree()));
        registry.insert(ready_session("dd:ee:ff", 2, heart_rate_tree()));
        registry
    }

    #[test]
    fn shared_service_uuid_resolves_to_first_inserted_session() {
        let registry = two_sessions_with_shared_uuids();

        for _ in 0..3 {
            let found = find_service(&registry, expand_short_uuid(0x180D))
                .expect("service should resolve");
            assert_eq!("AA:BB:CC", found.session.address().as_str());
        }
    }

    #[test]
    fn shared_characteristic_uuid_resolves_to_first_inserted_session() {
        let registry = two_sessions_with_shared_uuids();

        let found = find_characteristic(&registry, expand_short_uuid(0x2A37))
            .expect("characteristic should resolve");
        assert_eq!("AA:BB:CC", found.session.address().as_str());
        assert_eq!(expand_short_uuid(0x180D), found.service.uuid());
    }

    #[test]
    fn unknown_uuid_reports_not_found() {
        let registry = two_sessions_with_shared_uuids();

        assert_matches!(
            find_service(&registry, expand_short_uuid(0x1800)),
            Err(ResolveError::NotFound {
                kind: AttributeKind::Service,
                ..
            })
        );
        assert_matches!(
            find_characteristic(&registry, expand_short_uuid(0x2A38)),
            Err(ResolveError::NotFound {
                kind: AttributeKind::Characteristic,
                ..
            })
        );
    }

    #[test]
    fn descriptor_lookup_requires_a_parent() {
        let registry = two_sessions_with_shared_uuids();

        assert_matches!(
            find_descriptor(&registry, CCC_DESCRIPTOR_UUID, None),
            Err(ResolveError::AmbiguousParentRequired { .. })
        );

        let found = find_descriptor(
            &registry,
            CCC_DESCRIPTOR_UUID,
            Some(expand_short_uuid(0x2A37)),
        )
        .expect("descriptor should resolve under its parent");
        assert_eq!(CCC_DESCRIPTOR_UUID, found.descriptor.uuid());
        assert_eq!("AA:BB:CC", found.session.address().as_str());
    }

    #[test]
    fn sessions_without_discovered_services_are_skipped() {
        let mut registry = SessionRegistry::new();
        registry.insert(ConnectionSession::new(
            PeripheralAddress::new("aa:bb:cc"),
            None,
            TransportHandle::new(1),
        ));
        registry.insert(ready_session("dd:ee:ff", 2, heart_rate_tree()));

        let found = find_characteristic(&registry, expand_short_uuid(0x2A37))
            .expect("characteristic should resolve");
        assert_eq!("DD:EE:FF", found.session.address().as_str());
    }
}
