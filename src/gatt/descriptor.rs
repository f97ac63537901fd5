//! GATT descriptor.
//!
//! Descriptors are not registered on their own. Their requests carry the
//! owning characteristic's path plus the descriptor UUID and resolve through
//! the characteristic registry.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::ble::native::{GattHandle, NativeResultExt, NativeStatus};
use crate::context::GattContext;
use crate::error::Result;
use crate::gatt::snapshot::DescriptorSnapshot;
use crate::gatt::{report_discovery_failure, CharacteristicPath, DescriptorPath};
use crate::registry::Continuation;

/// A discovered descriptor.
pub struct Descriptor {
    path: DescriptorPath,
    handle: GattHandle,
    value: RwLock<Option<Bytes>>,
    ctx: Arc<GattContext>,
}

impl Descriptor {
    pub(crate) fn discover(
        ctx: &Arc<GattContext>,
        characteristic: &CharacteristicPath,
        handle: GattHandle,
    ) -> Option<Self> {
        let uuid = match ctx.stack.uuid(handle) {
            Ok(uuid) => uuid,
            Err(status) => {
                report_discovery_failure(
                    ctx,
                    &characteristic.remote_id,
                    "get descriptor uuid",
                    status,
                );
                return None;
            }
        };

        let path = DescriptorPath::new(characteristic.clone(), uuid);
        trace!("Discovered descriptor {}", path);
        Some(Self {
            path,
            handle,
            value: RwLock::new(None),
            ctx: ctx.clone(),
        })
    }

    /// Full path of this descriptor.
    pub fn path(&self) -> &DescriptorPath {
        &self.path
    }

    /// Descriptor UUID.
    pub fn uuid(&self) -> Uuid {
        self.path.uuid
    }

    /// Native handle.
    pub fn handle(&self) -> GattHandle {
        self.handle
    }

    /// Cached value, if one was read or written.
    pub fn value(&self) -> Option<Bytes> {
        self.value.read().clone()
    }

    /// Read the remote value. `callback` fires with the native status unless
    /// the owning characteristic has been dropped by then.
    pub fn read<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(NativeStatus, &Arc<Descriptor>) + Send + 'static,
    {
        let continuation = Continuation::new(self.path.characteristic.clone(), callback);
        let registry = self.ctx.characteristics.clone();
        let uuid = self.path.uuid;

        self.ctx
            .stack
            .read_value(
                self.handle,
                Box::new(move |status| {
                    let Some((characteristic, callback)) = continuation.resolve(&registry) else {
                        return;
                    };
                    let Some(descriptor) = characteristic.descriptor(&uuid) else {
                        trace!("Descriptor {} gone from {}", uuid, characteristic.path());
                        return;
                    };
                    if status.is_ok() {
                        descriptor.refresh_value();
                    } else {
                        warn!("Read of {} failed: {}", descriptor.path, status);
                    }
                    callback(status, &descriptor);
                }),
            )
            .logged("read descriptor value")
    }

    /// Write `value` to the remote. `callback` reports success.
    pub fn write<F>(&self, value: &[u8], callback: F) -> Result<()>
    where
        F: FnOnce(bool, &Arc<Descriptor>) + Send + 'static,
    {
        self.ctx
            .stack
            .set_value(self.handle, value)
            .logged("set descriptor value")?;

        let continuation = Continuation::new(self.path.characteristic.clone(), callback);
        let registry = self.ctx.characteristics.clone();
        let uuid = self.path.uuid;

        self.ctx
            .stack
            .write_value(
                self.handle,
                Box::new(move |status| {
                    let Some((characteristic, callback)) = continuation.resolve(&registry) else {
                        return;
                    };
                    let Some(descriptor) = characteristic.descriptor(&uuid) else {
                        return;
                    };
                    let success = status.is_ok();
                    if success {
                        descriptor.refresh_value();
                    } else {
                        warn!("Write of {} failed: {}", descriptor.path, status);
                    }
                    callback(success, &descriptor);
                }),
            )
            .logged("write descriptor value")
    }

    /// Owned export.
    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            path: self.path.clone(),
            value: self.value().map(|v| v.to_vec()).unwrap_or_default(),
        }
    }

    fn refresh_value(&self) {
        match self.ctx.stack.value(self.handle) {
            Ok(value) => *self.value.write() = Some(Bytes::from(value)),
            Err(status) => warn!("Reading cached value of {} failed: {}", self.path, status),
        }
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .finish()
    }
}
