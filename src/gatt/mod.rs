//! GATT entity tree.
//!
//! A device owns primary services; a primary service owns its characteristics
//! and its included (secondary) services; a secondary service owns only
//! characteristics. Characteristics own their descriptors. The whole tree is
//! rebuilt by every discovery pass and dropped on disconnect.

pub mod characteristic;
pub mod descriptor;
pub mod service;
pub mod snapshot;

pub use characteristic::{Characteristic, CharacteristicProperties, NotifyCallback};
pub use descriptor::Descriptor;
pub use service::{Service, ServiceKind};
pub use snapshot::{
    CharacteristicSnapshot, DescriptorSnapshot, DeviceSnapshot, ServiceSnapshot, TreeCounts,
};

use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::ble::native::{collect_handles, GattHandle, HandleVisitor, NativeResult, NativeStatus};
use crate::context::GattContext;
use crate::notifications::GattEvent;

/// Location of a service inside a device's tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServicePath {
    /// UUID of the primary service.
    pub primary: Uuid,
    /// UUID of the included service inside `primary`, if any.
    pub secondary: Option<Uuid>,
}

impl ServicePath {
    /// Path to a primary service.
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            primary: uuid,
            secondary: None,
        }
    }

    /// Path to a service included by `primary`.
    pub fn secondary(primary: Uuid, secondary: Uuid) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
        }
    }

    /// UUID of the service this path ends at.
    pub fn service_uuid(&self) -> Uuid {
        self.secondary.unwrap_or(self.primary)
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.secondary {
            Some(secondary) => write!(f, "{}/{}", self.primary, secondary),
            None => write!(f, "{}", self.primary),
        }
    }
}

/// Full path to a characteristic. Doubles as its registry key.
///
/// Scoping by device address and service path keeps equal characteristic
/// UUIDs on different devices, or in different services, apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicPath {
    /// Address of the owning device.
    pub remote_id: String,
    /// Owning service.
    pub service: ServicePath,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl CharacteristicPath {
    /// Build a path.
    pub fn new(remote_id: impl Into<String>, service: ServicePath, uuid: Uuid) -> Self {
        Self {
            remote_id: remote_id.into(),
            service,
            uuid,
        }
    }
}

impl fmt::Display for CharacteristicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.remote_id, self.service, self.uuid)
    }
}

/// Full path to a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorPath {
    /// Owning characteristic.
    pub characteristic: CharacteristicPath,
    /// Descriptor UUID.
    pub uuid: Uuid,
}

impl DescriptorPath {
    /// Build a path.
    pub fn new(characteristic: CharacteristicPath, uuid: Uuid) -> Self {
        Self {
            characteristic,
            uuid,
        }
    }
}

impl fmt::Display for DescriptorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.uuid)
    }
}

/// Log a failed discovery step and publish it on the event channel.
pub(crate) fn report_discovery_failure(
    ctx: &GattContext,
    remote_id: &str,
    operation: &'static str,
    status: NativeStatus,
) {
    warn!("{} on {} failed: {}", operation, remote_id, status);
    ctx.events.send(GattEvent::DiscoveryFailed {
        remote_id: remote_id.to_string(),
        operation,
        status,
    });
}

/// Run one enumeration, degrading a failure to an empty branch.
pub(crate) fn enumerate_or_empty<F>(
    ctx: &GattContext,
    remote_id: &str,
    operation: &'static str,
    enumerate: F,
) -> Vec<GattHandle>
where
    F: FnOnce(HandleVisitor<'_>) -> NativeResult<()>,
{
    match collect_handles(enumerate) {
        Ok(handles) => handles,
        Err(status) => {
            report_discovery_failure(ctx, remote_id, operation, status);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::uuid_from_u16;

    #[test]
    fn test_service_path_uuid() {
        let primary = uuid_from_u16(0x180a);
        let secondary = uuid_from_u16(0x180f);
        assert_eq!(ServicePath::primary(primary).service_uuid(), primary);
        assert_eq!(
            ServicePath::secondary(primary, secondary).service_uuid(),
            secondary
        );
    }

    #[test]
    fn test_paths_differ_across_devices() {
        let service = ServicePath::primary(uuid_from_u16(0x180d));
        let uuid = uuid_from_u16(0x2a37);
        let a = CharacteristicPath::new("AA:BB:CC:DD:EE:01", service, uuid);
        let b = CharacteristicPath::new("AA:BB:CC:DD:EE:02", service, uuid);
        assert_ne!(a, b);
    }

    #[test]
    fn test_paths_differ_across_services() {
        let uuid = uuid_from_u16(0x2a37);
        let a = CharacteristicPath::new("X", ServicePath::primary(uuid_from_u16(0x180d)), uuid);
        let b = CharacteristicPath::new(
            "X",
            ServicePath::secondary(uuid_from_u16(0x180d), uuid_from_u16(0x1810)),
            uuid,
        );
        assert_ne!(a, b);
    }
}
