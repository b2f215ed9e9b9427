//! Advertising-payload helpers.
//!
//! Discovery backends hand the core a raw advertising payload; the parser
//! here extracts the advertised service UUIDs and local name from its AD
//! structures. The encoder produces payloads in the same format and is
//! used by backends that only see pre-parsed advertisement fields, and by
//! test fixtures.

use uuid::Uuid;

use crate::identifier::{expand_short_uuid, short_form};

const AD_TYPE_INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
const AD_TYPE_COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
const AD_TYPE_INCOMPLETE_SERVICE_UUIDS_128: u8 = 0x06;
const AD_TYPE_COMPLETE_SERVICE_UUIDS_128: u8 = 0x07;
const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Extracts advertised service UUIDs from a raw advertising payload.
///
/// Short-form UUID lists are expanded into the Bluetooth Base UUID
/// template. Malformed or truncated AD structures are skipped.
#[must_use]
pub fn service_uuids(payload: &[u8]) -> Vec<Uuid> {
    let mut uuids = Vec::new();
    for (ad_type, data) in ad_structures(payload) {
        match ad_type {
            AD_TYPE_INCOMPLETE_SERVICE_UUIDS_16 | AD_TYPE_COMPLETE_SERVICE_UUIDS_16 => {
                for chunk in data.chunks_exact(2) {
                    let short = u16::from_le_bytes([chunk[0], chunk[1]]);
                    push_unique(&mut uuids, expand_short_uuid(short));
                }
            }
            AD_TYPE_INCOMPLETE_SERVICE_UUIDS_128 | AD_TYPE_COMPLETE_SERVICE_UUIDS_128 => {
                for chunk in data.chunks_exact(16) {
                    let Ok(bytes) = <[u8; 16]>::try_from(chunk) else {
                        continue;
                    };
                    push_unique(&mut uuids, Uuid::from_u128(u128::from_le_bytes(bytes)));
                }
            }
            _ => {}
        }
    }
    uuids
}

/// Extracts the advertised local name, preferring the complete form.
#[must_use]
pub fn local_name(payload: &[u8]) -> Option<String> {
    let mut shortened = None;
    for (ad_type, data) in ad_structures(payload) {
        match ad_type {
            AD_TYPE_COMPLETE_LOCAL_NAME => {
                return Some(String::from_utf8_lossy(data).into_owned());
            }
            AD_TYPE_SHORTENED_LOCAL_NAME if shortened.is_none() => {
                shortened = Some(String::from_utf8_lossy(data).into_owned());
            }
            _ => {}
        }
    }
    shortened
}

/// Encodes service-UUID AD structures for the given UUID list.
///
/// UUIDs that fit the Bluetooth Base UUID template are emitted as a
/// complete 16-bit list, the rest as a complete 128-bit list.
#[must_use]
pub fn encode_service_uuids(uuids: &[Uuid]) -> Vec<u8> {
    let mut shorts = Vec::new();
    let mut longs = Vec::new();
    for uuid in uuids {
        match short_form(*uuid) {
            Some(short) => shorts.push(short),
            None => longs.push(*uuid),
        }
    }

    let mut payload = Vec::new();
    for record in shorts.chunks(120) {
        payload.push((record.len() * 2 + 1) as u8);
        payload.push(AD_TYPE_COMPLETE_SERVICE_UUIDS_16);
        for short in record {
            payload.extend_from_slice(&short.to_le_bytes());
        }
    }
    for record in longs.chunks(13) {
        payload.push((record.len() * 16 + 1) as u8);
        payload.push(AD_TYPE_COMPLETE_SERVICE_UUIDS_128);
        for uuid in record {
            payload.extend_from_slice(&uuid.as_u128().to_le_bytes());
        }
    }
    payload
}

/// Encodes a complete-local-name AD structure.
#[must_use]
pub fn encode_local_name(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let take = bytes.len().min(254);
    let mut payload = Vec::with_capacity(take + 2);
    payload.push((take + 1) as u8);
    payload.push(AD_TYPE_COMPLETE_LOCAL_NAME);
    payload.extend_from_slice(&bytes[..take]);
    payload
}

fn ad_structures(payload: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        let length = *payload.get(offset)? as usize;
        if length == 0 {
            return None;
        }
        let end = offset + 1 + length;
        if end > payload.len() {
            return None;
        }
        let ad_type = payload[offset + 1];
        let data = &payload[offset + 2..end];
        offset = end;
        Some((ad_type, data))
    })
}

fn push_unique(uuids: &mut Vec<Uuid>, uuid: Uuid) {
    if !uuids.contains(&uuid) {
        uuids.push(uuid);
    }
}
