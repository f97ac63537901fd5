//! GATT services.
//!
//! Primary and included services share one type. The kind tag carries what
//! differs: a primary owns its included services, an included service knows
//! which primary encloses it.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::ble::connection::ConnectionFlags;
use crate::ble::native::GattHandle;
use crate::context::GattContext;
use crate::gatt::characteristic::Characteristic;
use crate::gatt::snapshot::ServiceSnapshot;
use crate::gatt::{enumerate_or_empty, report_discovery_failure, ServicePath};

/// What kind of service this is.
#[derive(Debug)]
pub enum ServiceKind {
    /// Top-level service of a device.
    Primary {
        /// Included services in discovery order.
        included: Vec<Arc<Service>>,
    },
    /// Service included by a primary service. Never includes further services.
    Secondary {
        /// UUID of the enclosing primary service.
        primary_uuid: Uuid,
    },
}

/// A discovered service.
#[derive(Debug)]
pub struct Service {
    remote_id: String,
    uuid: Uuid,
    handle: GattHandle,
    kind: ServiceKind,
    characteristics: Vec<Arc<Characteristic>>,
}

impl Service {
    /// Build a primary service, its characteristics and its included services.
    pub(crate) fn discover_primary(
        ctx: &Arc<GattContext>,
        link: &Arc<ConnectionFlags>,
        remote_id: &str,
        handle: GattHandle,
    ) -> Option<Self> {
        let uuid = Self::read_uuid(ctx, remote_id, handle)?;
        let path = ServicePath::primary(uuid);
        let characteristics = Self::discover_characteristics(ctx, link, remote_id, path, handle);

        let included = enumerate_or_empty(ctx, remote_id, "foreach included services", |visitor| {
            ctx.stack.foreach_included_services(handle, visitor)
        })
        .into_iter()
        .filter_map(|included| Self::discover_secondary(ctx, link, remote_id, uuid, included))
        .map(Arc::new)
        .collect();

        debug!("Discovered primary service {} on {}", uuid, remote_id);
        Some(Self {
            remote_id: remote_id.to_string(),
            uuid,
            handle,
            kind: ServiceKind::Primary { included },
            characteristics,
        })
    }

    fn discover_secondary(
        ctx: &Arc<GattContext>,
        link: &Arc<ConnectionFlags>,
        remote_id: &str,
        primary_uuid: Uuid,
        handle: GattHandle,
    ) -> Option<Self> {
        let uuid = Self::read_uuid(ctx, remote_id, handle)?;
        let path = ServicePath::secondary(primary_uuid, uuid);
        let characteristics = Self::discover_characteristics(ctx, link, remote_id, path, handle);

        debug!(
            "Discovered included service {} in {} on {}",
            uuid, primary_uuid, remote_id
        );
        Some(Self {
            remote_id: remote_id.to_string(),
            uuid,
            handle,
            kind: ServiceKind::Secondary { primary_uuid },
            characteristics,
        })
    }

    fn read_uuid(ctx: &GattContext, remote_id: &str, handle: GattHandle) -> Option<Uuid> {
        match ctx.stack.uuid(handle) {
            Ok(uuid) => Some(uuid),
            Err(status) => {
                report_discovery_failure(ctx, remote_id, "get service uuid", status);
                None
            }
        }
    }

    fn discover_characteristics(
        ctx: &Arc<GattContext>,
        link: &Arc<ConnectionFlags>,
        remote_id: &str,
        path: ServicePath,
        handle: GattHandle,
    ) -> Vec<Arc<Characteristic>> {
        enumerate_or_empty(ctx, remote_id, "foreach characteristics", |visitor| {
            ctx.stack.foreach_characteristics(handle, visitor)
        })
        .into_iter()
        .filter_map(|characteristic| {
            Characteristic::discover(ctx, link, remote_id, path, characteristic)
        })
        .collect()
    }

    /// Address of the owning device.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Service UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Native handle.
    pub fn handle(&self) -> GattHandle {
        self.handle
    }

    /// Kind tag.
    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    /// Whether this is a primary service.
    pub fn is_primary(&self) -> bool {
        matches!(self.kind, ServiceKind::Primary { .. })
    }

    /// Path to this service.
    pub fn path(&self) -> ServicePath {
        match self.kind {
            ServiceKind::Primary { .. } => ServicePath::primary(self.uuid),
            ServiceKind::Secondary { primary_uuid } => {
                ServicePath::secondary(primary_uuid, self.uuid)
            }
        }
    }

    /// Characteristics in discovery order.
    pub fn characteristics(&self) -> &[Arc<Characteristic>] {
        &self.characteristics
    }

    /// Characteristic by UUID. The first match wins if the device repeats one.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<Arc<Characteristic>> {
        self.characteristics
            .iter()
            .find(|c| c.uuid() == *uuid)
            .cloned()
    }

    /// Included services. Always empty for an included service.
    pub fn included_services(&self) -> &[Arc<Service>] {
        match &self.kind {
            ServiceKind::Primary { included } => included,
            ServiceKind::Secondary { .. } => &[],
        }
    }

    /// Included service by UUID.
    pub fn included(&self, uuid: &Uuid) -> Option<Arc<Service>> {
        self.included_services()
            .iter()
            .find(|s| s.uuid == *uuid)
            .cloned()
    }

    /// Owned export of this service and everything below it.
    pub fn snapshot(&self) -> ServiceSnapshot {
        let primary_uuid = match self.kind {
            ServiceKind::Primary { .. } => None,
            ServiceKind::Secondary { primary_uuid } => Some(primary_uuid),
        };

        ServiceSnapshot {
            remote_id: self.remote_id.clone(),
            uuid: self.uuid,
            is_primary: self.is_primary(),
            primary_uuid,
            characteristics: self.characteristics.iter().map(|c| c.snapshot()).collect(),
            included_services: self
                .included_services()
                .iter()
                .map(|s| s.snapshot())
                .collect(),
        }
    }
}
