use serde::{Serialize, Serializer};
use serde_with::serde_as;
use uuid::Uuid;

use crate::identifier::{CCC_DESCRIPTOR_UUID, PeripheralAddress, canonical_uuid};

/// CCC descriptor value enabling unacknowledged notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCC descriptor value enabling acknowledged indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCC descriptor value disabling value-change delivery.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// A peripheral observed during discovery, refreshed in place whenever the
/// same address is seen again.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DiscoveredPeripheral {
    address: PeripheralAddress,
    local_name: Option<String>,
    rssi: Option<i16>,
    #[serde_as(as = "serde_with::hex::Hex")]
    advertisement: Vec<u8>,
    #[serde(serialize_with = "serialize_canonical_uuids")]
    service_uuids: Vec<Uuid>,
}

impl DiscoveredPeripheral {
    /// Creates a discovery record from one scan callback.
    pub(crate) fn new(
        address: PeripheralAddress,
        local_name: Option<String>,
        rssi: Option<i16>,
        advertisement: Vec<u8>,
        service_uuids: Vec<Uuid>,
    ) -> Self {
        Self {
            address,
            local_name,
            rssi,
            advertisement,
            service_uuids,
        }
    }

    /// Returns the peripheral address.
    #[must_use]
    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the last-seen signal strength, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns the raw advertising payload.
    #[must_use]
    pub fn advertisement(&self) -> &[u8] {
        &self.advertisement
    }

    /// Returns the service UUIDs parsed from the advertising payload.
    #[must_use]
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }
}

/// A GATT descriptor discovered under a characteristic.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DescriptorNode {
    #[serde(serialize_with = "serialize_canonical_uuid")]
    uuid: Uuid,
}

impl DescriptorNode {
    /// Creates a descriptor node.
    #[must_use]
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    /// Returns the descriptor UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// A GATT characteristic with its property labels and descriptors.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicNode {
    #[serde(serialize_with = "serialize_canonical_uuid")]
    uuid: Uuid,
    properties: Vec<String>,
    descriptors: Vec<DescriptorNode>,
}

impl CharacteristicNode {
    /// Creates a characteristic node with lower-case property labels.
    #[must_use]
    pub fn new(uuid: Uuid, properties: Vec<String>, descriptors: Vec<DescriptorNode>) -> Self {
        Self {
            uuid,
            properties,
            descriptors,
        }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns property labels such as `read`, `write` or `notify`.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Returns the descriptors discovered under this characteristic.
    #[must_use]
    pub fn descriptors(&self) -> &[DescriptorNode] {
        &self.descriptors
    }

    /// Returns whether a property label is present, ignoring case.
    #[must_use]
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }

    /// Returns whether writes may be issued without peer acknowledgment.
    #[must_use]
    pub fn supports_write_without_response(&self) -> bool {
        self.has_property("write_without_response")
    }

    /// Returns whether the peripheral can push acknowledged indications.
    #[must_use]
    pub fn supports_indicate(&self) -> bool {
        self.has_property("indicate")
    }

    /// Returns the descriptor with the given UUID, if discovered.
    #[must_use]
    pub fn find_descriptor(&self, uuid: Uuid) -> Option<&DescriptorNode> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.uuid() == uuid)
    }

    /// Returns the Client Characteristic Configuration descriptor, if any.
    #[must_use]
    pub fn ccc_descriptor(&self) -> Option<&DescriptorNode> {
        self.find_descriptor(CCC_DESCRIPTOR_UUID)
    }
}

/// A GATT service with its discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceNode {
    #[serde(serialize_with = "serialize_canonical_uuid")]
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<CharacteristicNode>,
}

impl ServiceNode {
    /// Creates a service node.
    #[must_use]
    pub fn new(uuid: Uuid, primary: bool, characteristics: Vec<CharacteristicNode>) -> Self {
        Self {
            uuid,
            primary,
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns whether this is a primary service.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Returns the characteristics discovered under this service.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicNode] {
        &self.characteristics
    }

    /// Returns the characteristic with the given UUID, if discovered.
    #[must_use]
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&CharacteristicNode> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid() == uuid)
    }
}

/// Radio availability reported by the embedding platform. The session core
/// records and exposes it but does not own the underlying adapter state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
pub enum ServiceState {
    /// No adapter is present.
    #[default]
    #[display("none")]
    None,
    /// An adapter is present but powered off.
    #[display("inactive")]
    Inactive,
    /// The adapter is powered and usable.
    #[display("active")]
    Active,
    /// The platform does not support BLE.
    #[display("unsupported")]
    Unsupported,
}

fn serialize_canonical_uuid<S>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&canonical_uuid(*uuid))
}

fn serialize_canonical_uuids<S>(uuids: &[Uuid], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(uuids.iter().map(|uuid| canonical_uuid(*uuid)))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::identifier::expand_short_uuid;

    fn characteristic(properties: &[&str]) -> CharacteristicNode {
        CharacteristicNode::new(
            expand_short_uuid(0x2A37),
            properties.iter().map(|label| (*label).to_string()).collect(),
            vec![DescriptorNode::new(CCC_DESCRIPTOR_UUID)],
        )
    }

    #[rstest]
    #[case(&["read", "notify"], "NOTIFY", true)]
    #[case(&["read", "notify"], "indicate", false)]
    #[case(&[], "read", false)]
    fn has_property_ignores_case(
        #[case] properties: &[&str],
        #[case] query: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, characteristic(properties).has_property(query));
    }

    #[test]
    fn ccc_descriptor_is_found_by_well_known_uuid() {
        let node = characteristic(&["notify"]);
        assert_eq!(
            Some(CCC_DESCRIPTOR_UUID),
            node.ccc_descriptor().map(DescriptorNode::uuid)
        );
    }

    #[test]
    fn find_characteristic_matches_by_uuid() {
        let service = ServiceNode::new(
            expand_short_uuid(0x180D),
            true,
            vec![characteristic(&["notify"])],
        );
        assert_eq!(None, service.find_characteristic(expand_short_uuid(0x2A38)));
        assert!(service.find_characteristic(expand_short_uuid(0x2A37)).is_some());
    }
}
