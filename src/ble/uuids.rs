//! Well-known GATT UUIDs and short-UUID helpers.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Bluetooth Base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number onto the Bluetooth Base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

// Services
/// Generic Access service.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = uuid_from_u16(0x1800);
/// Generic Attribute service.
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: Uuid = uuid_from_u16(0x1801);
/// Device Information service.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Battery service.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);

// Characteristics
/// Device Name characteristic.
pub const DEVICE_NAME_UUID: Uuid = uuid_from_u16(0x2a00);
/// Service Changed characteristic.
pub const SERVICE_CHANGED_UUID: Uuid = uuid_from_u16(0x2a05);
/// Battery Level characteristic.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);
/// Manufacturer Name characteristic.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Model Number characteristic.
pub const MODEL_NUMBER_UUID: Uuid = uuid_from_u16(0x2a24);
/// Firmware Revision characteristic.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);

// Descriptors
/// Characteristic User Description descriptor.
pub const USER_DESCRIPTION_UUID: Uuid = uuid_from_u16(0x2901);
/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid_from_u16(0x2902);

/// The 16-bit assigned number of a UUID, if it sits on the Base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask: u128 = !(0xffff_u128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Parse a UUID in either 16-bit (`"180a"`), 32-bit (`"0000180a"`) or full
/// hyphenated form.
pub fn parse_uuid(text: &str) -> Result<Uuid> {
    let trimmed = text.trim();
    let invalid = || Error::Internal(format!("invalid UUID: {:?}", text));

    match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}
