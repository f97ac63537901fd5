//! GATT characteristic.
//!
//! Characteristics are the anchor of the callback-safety scheme: each one
//! registers itself in the characteristic registry under its full path, and
//! every read, write and notification callback resolves that path before it
//! touches the characteristic again.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::connection::ConnectionFlags;
use crate::ble::native::{
    GattHandle, NativeResultExt, NativeStatus, ValueChangedCallback, WriteType,
};
use crate::context::GattContext;
use crate::error::{Error, Result};
use crate::gatt::descriptor::Descriptor;
use crate::gatt::snapshot::CharacteristicSnapshot;
use crate::gatt::{enumerate_or_empty, report_discovery_failure, CharacteristicPath, ServicePath};
use crate::registry::{Continuation, Registration};

/// Characteristic property bitmask as reported by the stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(pub u32);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: u32 = 0x01;
    /// Read.
    pub const READ: u32 = 0x02;
    /// Write without response.
    pub const WRITE_WITHOUT_RESPONSE: u32 = 0x04;
    /// Write with response.
    pub const WRITE: u32 = 0x08;
    /// Notify.
    pub const NOTIFY: u32 = 0x10;
    /// Indicate.
    pub const INDICATE: u32 = 0x20;
    /// Authenticated signed writes.
    pub const AUTHENTICATED_SIGNED_WRITES: u32 = 0x40;
    /// Extended properties descriptor present.
    pub const EXTENDED_PROPERTIES: u32 = 0x80;

    /// Whether every bit of `flags` is set.
    pub fn contains(&self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Readable.
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Writable with or without response.
    pub fn can_write(&self) -> bool {
        self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE) != 0
    }

    /// Supports notifications.
    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    /// Supports indications.
    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }
}

/// Invoked for every notification or indication, after the cached value has
/// been updated.
pub type NotifyCallback = Arc<dyn Fn(&Arc<Characteristic>) + Send + Sync>;

/// A discovered characteristic.
pub struct Characteristic {
    path: CharacteristicPath,
    handle: GattHandle,
    properties: CharacteristicProperties,
    value: RwLock<Option<Bytes>>,
    descriptors: Vec<Arc<Descriptor>>,
    notify_callback: Mutex<Option<NotifyCallback>>,
    link: Arc<ConnectionFlags>,
    ctx: Arc<GattContext>,
    _registration: Registration<CharacteristicPath, Characteristic>,
}

impl Characteristic {
    /// Build a characteristic and its descriptors from a native handle.
    ///
    /// Returns `None` when the UUID cannot be read; the failure is reported
    /// and the caller skips this entry.
    pub(crate) fn discover(
        ctx: &Arc<GattContext>,
        link: &Arc<ConnectionFlags>,
        remote_id: &str,
        service: ServicePath,
        handle: GattHandle,
    ) -> Option<Arc<Self>> {
        let uuid = match ctx.stack.uuid(handle) {
            Ok(uuid) => uuid,
            Err(status) => {
                report_discovery_failure(ctx, remote_id, "get characteristic uuid", status);
                return None;
            }
        };

        let properties = match ctx.stack.properties(handle) {
            Ok(bits) => CharacteristicProperties(bits),
            Err(status) => {
                report_discovery_failure(ctx, remote_id, "get characteristic properties", status);
                CharacteristicProperties::default()
            }
        };

        let path = CharacteristicPath::new(remote_id, service, uuid);
        let descriptors = enumerate_or_empty(ctx, remote_id, "foreach descriptors", |visitor| {
            ctx.stack.foreach_descriptors(handle, visitor)
        })
        .into_iter()
        .filter_map(|descriptor| Descriptor::discover(ctx, &path, descriptor))
        .map(Arc::new)
        .collect();

        trace!("Discovered characteristic {}", path);

        Some(Arc::new_cyclic(|weak| Self {
            _registration: ctx.characteristics.register(path.clone(), weak.clone()),
            path,
            handle,
            properties,
            value: RwLock::new(None),
            descriptors,
            notify_callback: Mutex::new(None),
            link: link.clone(),
            ctx: ctx.clone(),
        }))
    }

    /// Full path of this characteristic.
    pub fn path(&self) -> &CharacteristicPath {
        &self.path
    }

    /// Characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.path.uuid
    }

    /// Native handle.
    pub fn handle(&self) -> GattHandle {
        self.handle
    }

    /// Property bitmask.
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    /// Cached value, if one was read, written or notified.
    pub fn value(&self) -> Option<Bytes> {
        self.value.read().clone()
    }

    /// Descriptors in discovery order.
    pub fn descriptors(&self) -> &[Arc<Descriptor>] {
        &self.descriptors
    }

    /// Descriptor by UUID.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<Arc<Descriptor>> {
        self.descriptors.iter().find(|d| d.uuid() == *uuid).cloned()
    }

    /// Whether a notification callback is installed.
    pub fn is_notifying(&self) -> bool {
        self.notify_callback.lock().is_some()
    }

    /// Read the remote value.
    ///
    /// `callback` fires with the native status once the read completes, with
    /// the cache refreshed on success. It never fires if the characteristic
    /// has been dropped by then.
    pub fn read<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(NativeStatus, &Arc<Characteristic>) + Send + 'static,
    {
        let continuation = Continuation::new(self.path.clone(), callback);
        let registry = self.ctx.characteristics.clone();

        self.ctx
            .stack
            .read_value(
                self.handle,
                Box::new(move |status| {
                    let Some((characteristic, callback)) = continuation.resolve(&registry) else {
                        return;
                    };
                    if status.is_ok() {
                        characteristic.refresh_value();
                    } else {
                        warn!("Read of {} failed: {}", characteristic.path, status);
                    }
                    callback(status, &characteristic);
                }),
            )
            .logged("read characteristic value")
    }

    /// Write `value` to the remote.
    ///
    /// The write mode is applied to the native characteristic first and stays
    /// in effect for later writes. Write capability is not checked here; the
    /// stack reports an unsupported write through `callback`. The cache only
    /// takes the new value when the write succeeds.
    pub fn write<F>(&self, value: &[u8], without_response: bool, callback: F) -> Result<()>
    where
        F: FnOnce(bool, &Arc<Characteristic>) + Send + 'static,
    {
        let write_type = if without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        self.ctx
            .stack
            .set_write_type(self.handle, write_type)
            .logged("set write type")?;
        self.ctx
            .stack
            .set_value(self.handle, value)
            .logged("set characteristic value")?;

        let continuation = Continuation::new(self.path.clone(), callback);
        let registry = self.ctx.characteristics.clone();

        self.ctx
            .stack
            .write_value(
                self.handle,
                Box::new(move |status| {
                    let Some((characteristic, callback)) = continuation.resolve(&registry) else {
                        return;
                    };
                    let success = status.is_ok();
                    if success {
                        characteristic.refresh_value();
                    } else {
                        warn!("Write of {} failed: {}", characteristic.path, status);
                    }
                    callback(success, &characteristic);
                }),
            )
            .logged("write characteristic value")
    }

    /// Subscribe to notifications or indications, replacing any existing
    /// callback.
    pub fn set_notify_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&Arc<Characteristic>) + Send + Sync + 'static,
    {
        if !self.properties.can_notify() && !self.properties.can_indicate() {
            return Err(Error::MissingProperty {
                uuid: self.path.uuid,
                required: "notify or indicate",
            });
        }

        self.unset_notify_callback()?;
        *self.notify_callback.lock() = Some(Arc::new(callback));

        let key = self.path.clone();
        let registry = self.ctx.characteristics.clone();
        let on_change: ValueChangedCallback = Box::new(move |value: &[u8]| {
            let Some(characteristic) = registry.lookup(&key) else {
                trace!("Notification for released characteristic {}", key);
                return;
            };
            *characteristic.value.write() = Some(Bytes::copy_from_slice(value));
            let callback = characteristic.notify_callback.lock().clone();
            if let Some(callback) = callback {
                callback(&characteristic);
            }
        });

        if let Err(err) = self
            .ctx
            .stack
            .set_value_changed_cb(self.handle, on_change)
            .logged("set value changed callback")
        {
            self.notify_callback.lock().take();
            return Err(err);
        }

        debug!("Notifications enabled on {}", self.path);
        Ok(())
    }

    /// Unsubscribe. A no-op when nothing is installed.
    ///
    /// Local state is always cleared; the native unsubscribe is skipped
    /// while the link is not connected.
    pub fn unset_notify_callback(&self) -> Result<()> {
        if self.notify_callback.lock().take().is_none() {
            return Ok(());
        }

        if !self.link.state().is_connected() {
            debug!("Link down, skipping native unsubscribe for {}", self.path);
            return Ok(());
        }

        debug!("Notifications disabled on {}", self.path);
        self.ctx
            .stack
            .unset_value_changed_cb(self.handle)
            .logged("unset value changed callback")
    }

    /// Read and wait for the value.
    pub async fn read_value(&self) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.read(move |status, characteristic| {
            let result = status
                .check("read characteristic value")
                .map(|()| characteristic.value().unwrap_or_default());
            let _ = tx.send(result);
        })?;

        rx.await.map_err(|_| Error::Released {
            target: self.path.to_string(),
        })?
    }

    /// Write and wait for the outcome.
    pub async fn write_value(&self, value: &[u8], without_response: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.write(value, without_response, move |success, _| {
            let _ = tx.send(success);
        })?;

        let success = rx.await.map_err(|_| Error::Released {
            target: self.path.to_string(),
        })?;
        if success {
            Ok(())
        } else {
            Err(Error::native(
                "write characteristic value",
                NativeStatus::OPERATION_FAILED,
            ))
        }
    }

    /// Owned export of this characteristic and its descriptors.
    pub fn snapshot(&self) -> CharacteristicSnapshot {
        CharacteristicSnapshot {
            path: self.path.clone(),
            properties: self.properties,
            value: self.value().map(|v| v.to_vec()).unwrap_or_default(),
            notifying: self.is_notifying(),
            descriptors: self.descriptors.iter().map(|d| d.snapshot()).collect(),
        }
    }

    fn refresh_value(&self) {
        match self.ctx.stack.value(self.handle) {
            Ok(value) => *self.value.write() = Some(Bytes::from(value)),
            Err(status) => warn!("Reading cached value of {} failed: {}", self.path, status),
        }
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .field("properties", &self.properties)
            .field("descriptors", &self.descriptors.len())
            .finish()
    }
}

impl Drop for Characteristic {
    fn drop(&mut self) {
        if let Err(err) = self.unset_notify_callback() {
            debug!("Unsubscribe on drop of {} failed: {}", self.path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::uuid_from_u16;
    use crate::testing::{discovered, HEART_RATE_MEASUREMENT, TEST_ADDRESS};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOTIFY_READ: u32 = CharacteristicProperties::NOTIFY | CharacteristicProperties::READ;

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties(
            CharacteristicProperties::READ | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        );
        assert!(props.can_read());
        assert!(props.can_write());
        assert!(!props.can_notify());
        assert!(!props.can_indicate());
        assert!(CharacteristicProperties(CharacteristicProperties::INDICATE).can_indicate());
    }

    #[test]
    fn test_read_refreshes_cache() {
        let fixture = discovered(CharacteristicProperties::READ);
        fixture
            .stack
            .set_remote_value(fixture.profile.characteristic, &[0x06, 0x48]);

        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        fixture
            .characteristic
            .read(move |status, c| *out.lock() = Some((status, c.value())))
            .unwrap();
        assert!(seen.lock().is_none());

        assert_eq!(fixture.stack.complete_reads(NativeStatus::OK), 1);
        let (status, value) = seen.lock().take().unwrap();
        assert_eq!(status, NativeStatus::OK);
        assert_eq!(value.unwrap().as_ref(), &[0x06, 0x48]);
    }

    #[test]
    fn test_failed_read_still_calls_back() {
        let fixture = discovered(CharacteristicProperties::READ);
        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        fixture
            .characteristic
            .read(move |status, _| *out.lock() = Some(status))
            .unwrap();

        fixture.stack.complete_reads(NativeStatus::PERMISSION_DENIED);
        assert_eq!(*seen.lock(), Some(NativeStatus::PERMISSION_DENIED));
        assert!(fixture.characteristic.value().is_none());
    }

    #[test]
    fn test_read_after_drop_is_noop() {
        let fixture = discovered(CharacteristicProperties::READ);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fixture
            .characteristic
            .read(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let path = fixture.characteristic.path().clone();
        let ctx = fixture.ctx.clone();
        drop(fixture.characteristic);
        fixture.device.disconnect().unwrap();
        assert!(!ctx.characteristics.contains(&path));

        assert_eq!(fixture.stack.complete_reads(NativeStatus::OK), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_write_without_write_property_reports_failure() {
        let fixture = discovered(CharacteristicProperties::READ);
        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        fixture
            .characteristic
            .write(b"payload", false, move |success, c| {
                *out.lock() = Some((success, c.value()))
            })
            .unwrap();

        assert_eq!(fixture.stack.calls_named("write_value"), 1);
        fixture.stack.complete_writes(NativeStatus::NOT_SUPPORTED);

        let (success, value) = seen.lock().take().unwrap();
        assert!(!success);
        assert!(value.is_none());
        assert!(fixture.characteristic.value().is_none());
    }

    #[test]
    fn test_write_sets_mode_and_caches_on_success() {
        let fixture = discovered(CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        fixture
            .characteristic
            .write(&[1, 2, 3], true, |_, _| {})
            .unwrap();

        assert_eq!(
            fixture.stack.write_type_of(fixture.profile.characteristic),
            Some(WriteType::WithoutResponse)
        );
        fixture.stack.complete_writes(NativeStatus::OK);
        assert_eq!(fixture.characteristic.value().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_notify_requires_property() {
        let fixture = discovered(CharacteristicProperties::READ);
        let err = fixture.characteristic.set_notify_callback(|_| {}).unwrap_err();

        assert!(matches!(
            err,
            Error::MissingProperty { uuid, .. } if uuid == HEART_RATE_MEASUREMENT
        ));
        assert!(!fixture.characteristic.is_notifying());
        assert!(!fixture.stack.has_value_changed_cb(fixture.profile.characteristic));
        assert_eq!(fixture.stack.calls_named("set_value_changed_cb"), 0);
    }

    #[test]
    fn test_notification_updates_cache() {
        let fixture = discovered(NOTIFY_READ);
        let received = Arc::new(Mutex::new(Vec::new()));
        let out = received.clone();
        fixture
            .characteristic
            .set_notify_callback(move |c| out.lock().push(c.value().unwrap_or_default()))
            .unwrap();
        assert!(fixture.characteristic.is_notifying());

        assert!(fixture
            .stack
            .emit_value_changed(fixture.profile.characteristic, &[0x00, 0x50]));
        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].as_ref(), &[0x00, 0x50]);
        assert_eq!(
            fixture.characteristic.value().unwrap().as_ref(),
            &[0x00, 0x50]
        );
    }

    #[test]
    fn test_resubscribe_replaces_callback() {
        let fixture = discovered(CharacteristicProperties::INDICATE);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        fixture
            .characteristic
            .set_notify_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let counter = second.clone();
        fixture
            .characteristic
            .set_notify_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        fixture
            .stack
            .emit_value_changed(fixture.profile.characteristic, &[1]);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unset_twice_is_noop() {
        let fixture = discovered(NOTIFY_READ);
        fixture.characteristic.set_notify_callback(|_| {}).unwrap();

        fixture.characteristic.unset_notify_callback().unwrap();
        fixture.characteristic.unset_notify_callback().unwrap();
        assert_eq!(fixture.stack.calls_named("unset_value_changed_cb"), 1);
        assert!(!fixture.characteristic.is_notifying());
    }

    #[test]
    fn test_unset_skips_native_when_link_down() {
        let fixture = discovered(NOTIFY_READ);
        fixture.characteristic.set_notify_callback(|_| {}).unwrap();

        fixture
            .device
            .handle_connection_state_changed(NativeStatus::OK, false);
        fixture.characteristic.unset_notify_callback().unwrap();

        assert_eq!(fixture.stack.calls_named("unset_value_changed_cb"), 0);
        assert!(!fixture.characteristic.is_notifying());
    }

    #[test]
    fn test_failed_subscribe_clears_callback() {
        let fixture = discovered(NOTIFY_READ);
        fixture
            .stack
            .fail("set_value_changed_cb", NativeStatus::NOT_CONNECTED);

        let err = fixture.characteristic.set_notify_callback(|_| {}).unwrap_err();
        assert_eq!(err.native_status(), Some(NativeStatus::NOT_CONNECTED));
        assert!(!fixture.characteristic.is_notifying());
    }

    #[test]
    fn test_snapshot() {
        let fixture = discovered(NOTIFY_READ);
        let snapshot = fixture.characteristic.snapshot();

        assert_eq!(snapshot.path.remote_id, TEST_ADDRESS);
        assert_eq!(snapshot.path.uuid, HEART_RATE_MEASUREMENT);
        assert_eq!(snapshot.properties, CharacteristicProperties(NOTIFY_READ));
        assert!(snapshot.value.is_empty());
        assert_eq!(snapshot.descriptors.len(), 1);
        assert_eq!(snapshot.descriptors[0].path.uuid, uuid_from_u16(0x2902));
    }

    #[tokio::test]
    async fn test_read_value_async() {
        let fixture = discovered(CharacteristicProperties::READ);
        fixture
            .stack
            .set_remote_value(fixture.profile.characteristic, &[42]);

        let stack = fixture.stack.clone();
        let complete = async move {
            tokio::task::yield_now().await;
            stack.complete_reads(NativeStatus::OK)
        };
        let (value, completed) = tokio::join!(fixture.characteristic.read_value(), complete);

        assert_eq!(completed, 1);
        assert_eq!(value.unwrap().as_ref(), &[42]);
    }

    #[test]
    fn test_write_value_async_failure() {
        let fixture = discovered(CharacteristicProperties::WRITE);
        let stack = fixture.stack.clone();
        let complete = async move {
            tokio::task::yield_now().await;
            stack.complete_writes(NativeStatus::OPERATION_FAILED)
        };
        let (result, _) = tokio_test::block_on(async {
            tokio::join!(fixture.characteristic.write_value(&[1], false), complete)
        });

        tokio_test::assert_err!(result);
    }
}
