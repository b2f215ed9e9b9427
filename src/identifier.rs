use std::fmt;
use std::str::FromStr;

use serde_with::SerializeDisplay;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth Base UUID template with a zeroed 16-bit slot
/// (`0000xxxx-0000-1000-8000-00805F9B34FB`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_1000_8000_00805f9b34fb;

/// Bits occupied by the 16-bit short form inside the base template.
const SHORT_FORM_SLOT: u128 = 0xffff << 96;

/// Client Characteristic Configuration descriptor
/// (`00002902-0000-1000-8000-00805f9b34fb`).
pub const CCC_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Errors returned while parsing peripheral and attribute identifiers.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum IdentifierError {
    #[error("attribute identifier `{value}` is neither a 16-bit nor a 128-bit UUID")]
    InvalidUuid { value: String },
    #[error("peripheral address cannot be empty")]
    EmptyAddress,
}

/// A stable peripheral identifier, upper-cased on construction so that
/// lookups and emitted events agree on one canonical form.
#[derive(Debug, Clone, Eq, PartialEq, Hash, SerializeDisplay)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Creates an address from any case variant of the raw identifier.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// Returns the canonical upper-case form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = IdentifierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(IdentifierError::EmptyAddress);
        }
        Ok(Self::new(value))
    }
}

/// Expands a 16-bit short-form UUID into the Bluetooth Base UUID template.
#[must_use]
pub fn expand_short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

/// Contracts a UUID back to its 16-bit short form when it fits the
/// Bluetooth Base UUID template.
#[must_use]
pub fn short_form(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_FORM_SLOT == BLUETOOTH_BASE_UUID {
        Some(((value >> 96) & 0xffff) as u16)
    } else {
        None
    }
}

/// Parses an attribute identifier, accepting both the 16-bit short form
/// (`180D`) and the full 128-bit form in any letter case.
pub fn parse_attribute_uuid(value: &str) -> Result<Uuid, IdentifierError> {
    let trimmed = value.trim();
    let short_candidate = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if short_candidate.len() == 4
        && let Ok(short) = u16::from_str_radix(short_candidate, 16)
    {
        return Ok(expand_short_uuid(short));
    }

    Uuid::parse_str(trimmed).map_err(|_| IdentifierError::InvalidUuid {
        value: value.to_string(),
    })
}

/// Renders a UUID in the canonical upper-case form used by emitted events.
#[must_use]
pub fn canonical_uuid(uuid: Uuid) -> String {
    uuid.to_string().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0x180D, "0000180d-0000-1000-8000-00805f9b34fb")]
    #[case(0x2902, "00002902-0000-1000-8000-00805f9b34fb")]
    #[case(0xFFFF, "0000ffff-0000-1000-8000-00805f9b34fb")]
    fn expand_short_uuid_fills_base_template(#[case] short: u16, #[case] expected: &str) {
        assert_eq!(expected, expand_short_uuid(short).to_string());
    }

    #[rstest]
    #[case(0x0000)]
    #[case(0x180D)]
    #[case(0xFFFF)]
    fn short_form_round_trips_expanded_uuids(#[case] short: u16) {
        assert_eq!(Some(short), short_form(expand_short_uuid(short)));
    }

    #[rstest]
    #[case("d44bc439-abfd-45a2-b575-925416129600")]
    #[case("00012902-0000-1000-8000-00805f9b34fb")]
    #[case("00002902-0000-1000-8000-00805f9b34fc")]
    fn short_form_rejects_vendor_uuids(#[case] uuid: &str) {
        let parsed = Uuid::parse_str(uuid).expect("test UUID should parse");
        assert_eq!(None, short_form(parsed));
    }

    #[rstest]
    #[case("180D", "0000180d-0000-1000-8000-00805f9b34fb")]
    #[case("0x2902", "00002902-0000-1000-8000-00805f9b34fb")]
    #[case("0000180D-0000-1000-8000-00805F9B34FB", "0000180d-0000-1000-8000-00805f9b34fb")]
    #[case("d44bc439-abfd-45a2-b575-925416129600", "d44bc439-abfd-45a2-b575-925416129600")]
    fn parse_attribute_uuid_accepts_both_forms(#[case] input: &str, #[case] expected: &str) {
        let parsed = parse_attribute_uuid(input).expect("identifier should parse");
        assert_eq!(expected, parsed.to_string());
    }

    #[rstest]
    #[case("")]
    #[case("heart-rate")]
    #[case("18")]
    fn parse_attribute_uuid_rejects_malformed_input(#[case] input: &str) {
        assert_matches!(
            parse_attribute_uuid(input),
            Err(IdentifierError::InvalidUuid { .. })
        );
    }

    #[test]
    fn canonical_uuid_upper_cases_hex_digits() {
        let parsed = Uuid::parse_str("0000180d-0000-1000-8000-00805f9b34fb")
            .expect("test UUID should parse");
        assert_eq!("0000180D-0000-1000-8000-00805F9B34FB", canonical_uuid(parsed));
    }

    #[rstest]
    #[case("aa:bb:cc:dd:ee:ff", "AA:BB:CC:DD:EE:FF")]
    #[case(" AA:bb:CC:dd:EE:ff ", "AA:BB:CC:DD:EE:FF")]
    fn peripheral_address_normalises_to_upper_case(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(expected, PeripheralAddress::new(raw).as_str());
    }

    #[test]
    fn peripheral_address_rejects_empty_input() {
        assert_matches!(
            "  ".parse::<PeripheralAddress>(),
            Err(IdentifierError::EmptyAddress)
        );
    }
}
