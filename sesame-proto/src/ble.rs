//! BLE identifiers and advertisement parsing for Sesame locks
//!
//! The lock advertises a 16-bit service id and exposes two 128-bit
//! characteristics inside that service: one the controller writes command
//! segments to, one the lock notifies response segments on.

use uuid::Uuid;

/// Primary service, advertised as a Complete 16-bit Service UUID
pub const SERVICE_UUID16: u16 = 0xFD81;

/// Command characteristic (write without response)
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x16860002_a5ae_9856_b6d3_dbb4c676993e);

/// Response characteristic (notify)
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x16860003_a5ae_9856_b6d3_dbb4c676993e);

/// Bluetooth base UUID; 16-bit ids live in bits 96..112
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BASE_UUID_MASK: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// AD types used by the matcher
pub mod ad_types {
    pub const FLAGS: u8 = 0x01;
    pub const INCOMPLETE_SERVICE_UUIDS_16: u8 = 0x02;
    pub const COMPLETE_SERVICE_UUIDS_16: u8 = 0x03;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const SERVICE_DATA_16: u8 = 0x16;
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

/// Identifiers that define which advertisement and GATT data belongs to the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetIdentity {
    pub service_uuid16: u16,
    pub write_uuid: Uuid,
    pub notify_uuid: Uuid,
}

impl TargetIdentity {
    pub const SESAME: Self = Self {
        service_uuid16: SERVICE_UUID16,
        write_uuid: WRITE_CHARACTERISTIC_UUID,
        notify_uuid: NOTIFY_CHARACTERISTIC_UUID,
    };

    /// True when `data` carries a Complete 16-bit Service UUID list naming our service
    pub fn matches_advertisement(&self, data: &[u8]) -> bool {
        advertises_service16(data, self.service_uuid16)
    }
}

impl Default for TargetIdentity {
    fn default() -> Self {
        Self::SESAME
    }
}

/// Expand a 16-bit SIG id into the Bluetooth base UUID
pub fn uuid16_to_uuid(uuid16: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((uuid16 as u128) << 96))
}

/// Inverse of [`uuid16_to_uuid`]; `None` for vendor UUIDs
pub fn uuid_to_uuid16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_UUID_MASK != BASE_UUID {
        return None;
    }
    Some((value >> 96) as u16)
}

/// One length-type-value element of an advertisement payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Iterator over the AD structures of an advertisement payload
///
/// Stops at the first zero-length element (early termination padding) or at
/// an element whose length runs past the end of the payload.
pub struct AdStructures<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = AdStructure<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, tail) = self.rest.split_first()?;
        let len = len as usize;
        if len == 0 || len > tail.len() {
            self.rest = &[];
            return None;
        }
        let (element, rest) = tail.split_at(len);
        self.rest = rest;
        Some(AdStructure {
            ad_type: element[0],
            data: &element[1..],
        })
    }
}

pub fn ad_structures(data: &[u8]) -> AdStructures<'_> {
    AdStructures { rest: data }
}

/// Does the advertisement carry a Complete 16-bit Service UUID list containing `uuid16`?
pub fn advertises_service16(data: &[u8], uuid16: u16) -> bool {
    ad_structures(data)
        .filter(|ad| ad.ad_type == ad_types::COMPLETE_SERVICE_UUIDS_16)
        .any(|ad| {
            ad.data
                .chunks_exact(2)
                .any(|id| u16::from_le_bytes([id[0], id[1]]) == uuid16)
        })
}

/// Local name, if the advertisement carries one
pub fn local_name(data: &[u8]) -> Option<String> {
    ad_structures(data)
        .find(|ad| ad.ad_type == ad_types::COMPLETE_LOCAL_NAME)
        .map(|ad| String::from_utf8_lossy(ad.data).into_owned())
}

/// Builder for advertisement payloads
///
/// Used when the platform hands us parsed advertisement fields instead of the
/// raw bytes and we need to present them to the matcher unchanged.
#[derive(Debug, Default, Clone)]
pub struct AdvertisementBuilder {
    buf: Vec<u8>,
}

impl AdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, ad_type: u8, data: &[u8]) -> Self {
        // An AD structure can hold at most 254 data bytes
        let data = &data[..data.len().min(254)];
        self.buf.push(data.len() as u8 + 1);
        self.buf.push(ad_type);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn flags(self, flags: u8) -> Self {
        self.element(ad_types::FLAGS, &[flags])
    }

    pub fn complete_services16(self, ids: &[u16]) -> Self {
        let data: Vec<u8> = ids.iter().flat_map(|id| id.to_le_bytes()).collect();
        self.element(ad_types::COMPLETE_SERVICE_UUIDS_16, &data)
    }

    pub fn local_name(self, name: &str) -> Self {
        self.element(ad_types::COMPLETE_LOCAL_NAME, name.as_bytes())
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}
