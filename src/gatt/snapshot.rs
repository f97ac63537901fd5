//! Owned export of a device and its GATT tree.
//!
//! Snapshots are what leaves the core toward the message layer. They hold no
//! handles or references, so they stay valid after the tree is torn down.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::gatt::characteristic::CharacteristicProperties;
use crate::gatt::{CharacteristicPath, DescriptorPath};

/// Exported descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorSnapshot {
    /// Where the descriptor lives.
    pub path: DescriptorPath,
    /// Cached value. Empty until read.
    pub value: Vec<u8>,
}

/// Exported characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicSnapshot {
    /// Where the characteristic lives.
    pub path: CharacteristicPath,
    /// Property bitmask.
    pub properties: CharacteristicProperties,
    /// Cached value. Empty until read, written or notified.
    pub value: Vec<u8>,
    /// Whether a notification callback is installed.
    pub notifying: bool,
    /// Descriptors in discovery order.
    pub descriptors: Vec<DescriptorSnapshot>,
}

/// Exported service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceSnapshot {
    /// Address of the owning device.
    pub remote_id: String,
    /// Service UUID.
    pub uuid: Uuid,
    /// Primary or included.
    pub is_primary: bool,
    /// For included services, the UUID of the enclosing primary.
    pub primary_uuid: Option<Uuid>,
    /// Characteristics in discovery order.
    pub characteristics: Vec<CharacteristicSnapshot>,
    /// Included services in discovery order. Always empty for included services.
    pub included_services: Vec<ServiceSnapshot>,
}

/// Exported device summary.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSnapshot {
    /// Device address.
    pub remote_id: String,
    /// Display name.
    pub name: String,
    /// Connection state at export time.
    pub state: ConnectionState,
    /// Last RSSI reported by a scan.
    pub rssi: Option<i16>,
    /// When the device was last seen by a scan or created.
    pub last_seen: DateTime<Utc>,
}

/// Entity counts re-derived from an exported tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeCounts {
    /// Primary and included services.
    pub services: usize,
    /// Characteristics across all services.
    pub characteristics: usize,
    /// Descriptors across all characteristics.
    pub descriptors: usize,
}

impl TreeCounts {
    /// Count every entity in an exported tree.
    pub fn of(services: &[ServiceSnapshot]) -> Self {
        let mut counts = Self::default();
        for service in services {
            counts.add(service);
        }
        counts
    }

    fn add(&mut self, service: &ServiceSnapshot) {
        self.services += 1;
        self.characteristics += service.characteristics.len();
        self.descriptors += service
            .characteristics
            .iter()
            .map(|c| c.descriptors.len())
            .sum::<usize>();
        for included in &service.included_services {
            self.add(included);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::uuid_from_u16;
    use crate::gatt::ServicePath;

    fn characteristic(service: ServicePath, short: u16, descriptors: usize) -> CharacteristicSnapshot {
        let path = CharacteristicPath::new("AA:BB:CC:DD:EE:FF", service, uuid_from_u16(short));
        CharacteristicSnapshot {
            descriptors: (0..descriptors)
                .map(|i| DescriptorSnapshot {
                    path: DescriptorPath::new(path.clone(), uuid_from_u16(0x2900 + i as u16)),
                    value: Vec::new(),
                })
                .collect(),
            path,
            properties: CharacteristicProperties::default(),
            value: Vec::new(),
            notifying: false,
        }
    }

    #[test]
    fn test_counts_include_secondary_services() {
        let primary = uuid_from_u16(0x1800);
        let secondary = uuid_from_u16(0x1801);
        let tree = vec![ServiceSnapshot {
            remote_id: "AA:BB:CC:DD:EE:FF".to_string(),
            uuid: primary,
            is_primary: true,
            primary_uuid: None,
            characteristics: vec![characteristic(ServicePath::primary(primary), 0x2a00, 2)],
            included_services: vec![ServiceSnapshot {
                remote_id: "AA:BB:CC:DD:EE:FF".to_string(),
                uuid: secondary,
                is_primary: false,
                primary_uuid: Some(primary),
                characteristics: vec![
                    characteristic(ServicePath::secondary(primary, secondary), 0x2a05, 1),
                    characteristic(ServicePath::secondary(primary, secondary), 0x2a06, 0),
                ],
                included_services: Vec::new(),
            }],
        }];

        assert_eq!(
            TreeCounts::of(&tree),
            TreeCounts {
                services: 2,
                characteristics: 3,
                descriptors: 3,
            }
        );
    }

    #[test]
    fn test_counts_empty() {
        assert_eq!(TreeCounts::of(&[]), TreeCounts::default());
    }
}
