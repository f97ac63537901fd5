//! Per-device controller.
//!
//! Owns one device's connection state and its discovered GATT tree, and
//! issues connect, disconnect, discovery, MTU and RSSI requests.
//!
//! `Connecting` and `Disconnecting` are entered by the request methods and
//! left only by the native connection-state callback. Connect, disconnect,
//! discovery and the state callback are serialized by a per-device lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::connection::{ConnectionFlags, ConnectionState};
use crate::ble::native::{AdvertisementData, ClientHandle, NativeResultExt, NativeStatus, ScanResult};
use crate::ble::scanner::{ScanHandler, ScanSettings};
use crate::context::GattContext;
use crate::error::{Error, Result};
use crate::gatt::{
    enumerate_or_empty, Characteristic, CharacteristicPath, Descriptor, DescriptorPath,
    DeviceSnapshot, Service, ServiceSnapshot,
};
use crate::notifications::GattEvent;
use crate::registry::{Continuation, Registration};
use crate::utils::normalize_address;

/// Advertisement-derived information about a device.
#[derive(Debug, Clone)]
struct DeviceInfo {
    name: String,
    rssi: Option<i16>,
    advertisement: AdvertisementData,
    last_seen: DateTime<Utc>,
}

/// Controller for one remote device.
pub struct DeviceController {
    address: String,
    info: RwLock<DeviceInfo>,
    link: Arc<ConnectionFlags>,
    op_lock: ReentrantMutex<()>,
    services: RwLock<Vec<Arc<Service>>>,
    ctx: Arc<GattContext>,
    _registration: Registration<String, DeviceController>,
}

impl DeviceController {
    /// Create the controller for `address` and register it.
    pub(crate) fn new(ctx: &Arc<GattContext>, address: &str) -> Arc<Self> {
        let address = normalize_address(address);
        debug!("Creating device controller for {}", address);

        Arc::new_cyclic(|weak| Self {
            _registration: ctx.devices.register(address.clone(), weak.clone()),
            info: RwLock::new(DeviceInfo {
                name: String::new(),
                rssi: None,
                advertisement: AdvertisementData::default(),
                last_seen: Utc::now(),
            }),
            address,
            link: Arc::new(ConnectionFlags::default()),
            op_lock: ReentrantMutex::new(()),
            services: RwLock::new(Vec::new()),
            ctx: ctx.clone(),
        })
    }

    /// Device address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Display name, empty if never advertised.
    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    /// RSSI from the last scan report.
    pub fn rssi(&self) -> Option<i16> {
        self.info.read().rssi
    }

    /// Last decoded advertisement.
    pub fn advertisement(&self) -> AdvertisementData {
        self.info.read().advertisement.clone()
    }

    /// When the device was last seen by a scan.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.info.read().last_seen
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Refresh advertisement-derived fields from a scan report.
    pub(crate) fn update_from_scan(&self, result: &ScanResult) {
        let mut info = self.info.write();
        if let Some(name) = result
            .name
            .as_ref()
            .or(result.advertisement.local_name.as_ref())
        {
            info.name = name.clone();
        }
        info.rssi = Some(result.rssi);
        info.advertisement = result.advertisement.clone();
        info.last_seen = Utc::now();
    }

    /// Request a connection.
    ///
    /// Only allowed while disconnected. Auto-connect is always disabled
    /// whatever the caller asks for.
    pub fn connect(&self, auto_connect: bool) -> Result<()> {
        let _guard = self.op_lock.lock();

        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(self.invalid_state("connect", state));
        }
        if auto_connect {
            debug!("Auto-connect requested for {}, ignoring", self.address);
        }

        self.link.set_connecting(true);
        info!("Connecting to {}", self.address);
        if let Err(err) = self.ctx.stack.connect(&self.address, false).logged("connect") {
            self.link.set_connecting(false);
            return Err(err);
        }
        Ok(())
    }

    /// Request a disconnection. Does nothing unless connected.
    ///
    /// The GATT tree is dropped before the request is issued.
    pub fn disconnect(&self) -> Result<()> {
        let _guard = self.op_lock.lock();

        if self.state() != ConnectionState::Connected {
            debug!("{} not connected, ignoring disconnect", self.address);
            return Ok(());
        }

        self.clear_services();
        self.link.set_disconnecting(true);
        info!("Disconnecting from {}", self.address);
        if let Err(err) = self.ctx.stack.disconnect(&self.address).logged("disconnect") {
            self.link.set_disconnecting(false);
            return Err(err);
        }
        Ok(())
    }

    /// Apply a native connection-state report.
    ///
    /// Both pending flags are cleared whatever the outcome. On disconnect the
    /// tree is dropped before the new state becomes visible.
    pub(crate) fn handle_connection_state_changed(&self, status: NativeStatus, connected: bool) {
        let _guard = self.op_lock.lock();

        if connected && status.is_ok() {
            self.link.settle(true);
            if let Err(err) = self.ctx.clients.get_or_create(&self.address) {
                warn!("No GATT client for {}: {}", self.address, err);
            }
            info!("Connected to {}", self.address);
            return;
        }

        if connected {
            warn!("Connection to {} reported {}", self.address, status);
        }
        // The tree goes while the link already reads as down, so dropped
        // characteristics skip the native unsubscribe.
        self.link.begin_teardown();
        self.clear_services();
        self.link.settle(false);
        self.ctx.clients.destroy_if_exists(&self.address);
        info!("Disconnected from {} ({})", self.address, status);
    }

    /// Rebuild the GATT tree from the native client.
    ///
    /// Blocks while the stack enumerates. A failing enumeration leaves its
    /// branch empty and is reported as an event.
    pub fn discover_services(&self) -> Result<Vec<Arc<Service>>> {
        let _guard = self.op_lock.lock();

        let client = self.client("discover services")?;
        self.clear_services();

        let services: Vec<Arc<Service>> =
            enumerate_or_empty(&self.ctx, &self.address, "foreach services", |visitor| {
                self.ctx.stack.foreach_services(client, visitor)
            })
            .into_iter()
            .filter_map(|handle| Service::discover_primary(&self.ctx, &self.link, &self.address, handle))
            .map(Arc::new)
            .collect();

        debug!(
            "Discovered {} primary services on {}",
            services.len(),
            self.address
        );
        *self.services.write() = services.clone();
        Ok(services)
    }

    /// Primary services from the last discovery. Empty while disconnected.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().clone()
    }

    /// Primary service by UUID.
    pub fn service(&self, uuid: &Uuid) -> Option<Arc<Service>> {
        self.services.read().iter().find(|s| s.uuid() == *uuid).cloned()
    }

    /// Find a characteristic in the current tree.
    pub fn locate_characteristic(&self, path: &CharacteristicPath) -> Result<Arc<Characteristic>> {
        let primary = self.service(&path.service.primary).ok_or(Error::ServiceNotFound {
            uuid: path.service.primary,
        })?;
        let service = match path.service.secondary {
            Some(secondary) => primary
                .included(&secondary)
                .ok_or(Error::ServiceNotFound { uuid: secondary })?,
            None => primary,
        };

        service
            .characteristic(&path.uuid)
            .ok_or(Error::CharacteristicNotFound { uuid: path.uuid })
    }

    /// Find a descriptor in the current tree.
    pub fn locate_descriptor(&self, path: &DescriptorPath) -> Result<Arc<Descriptor>> {
        self.locate_characteristic(&path.characteristic)?
            .descriptor(&path.uuid)
            .ok_or(Error::DescriptorNotFound { uuid: path.uuid })
    }

    /// Current ATT MTU.
    pub fn mtu(&self) -> Result<u32> {
        let client = self.client("get MTU")?;
        self.ctx.stack.att_mtu(client).logged("get ATT MTU")
    }

    /// Ask for a new ATT MTU.
    ///
    /// `callback` fires with the status and resulting MTU unless the
    /// controller has been dropped by then.
    pub fn request_mtu<F>(&self, mtu: u32, callback: F) -> Result<()>
    where
        F: FnOnce(NativeStatus, u32, &Arc<DeviceController>) + Send + 'static,
    {
        let client = self.client("request MTU")?;
        let continuation = Continuation::new(self.address.clone(), callback);
        let registry = self.ctx.devices.clone();

        self.ctx
            .stack
            .set_att_mtu_changed_cb(
                client,
                Box::new(move |status, mtu| {
                    let Some((device, callback)) = continuation.resolve(&registry) else {
                        return;
                    };
                    if !status.is_ok() {
                        warn!("MTU change on {} failed: {}", device.address, status);
                    }
                    callback(status, mtu, &device);
                }),
            )
            .logged("set ATT MTU changed callback")?;

        debug!("Requesting MTU {} on {}", mtu, self.address);
        let requested = self
            .ctx
            .stack
            .request_att_mtu_change(client, mtu)
            .logged("request ATT MTU change");
        if requested.is_err() {
            if let Err(status) = self.ctx.stack.unset_att_mtu_changed_cb(client) {
                warn!("unset ATT MTU changed callback failed: {}", status);
            }
        }
        requested
    }

    /// Read the signal strength.
    ///
    /// Starts a scan filtered to this address, replacing any running scan,
    /// and forwards the RSSI of the first matching report.
    pub fn read_rssi<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(i16, &Arc<DeviceController>) + Send + 'static,
    {
        let pending = Mutex::new(Some(Continuation::new(self.address.clone(), callback)));
        let registry = self.ctx.devices.clone();
        let ctx = Arc::downgrade(&self.ctx);
        let stop_after_first = self.ctx.config.stop_scan_after_rssi;

        let handler: ScanHandler = Arc::new(move |session, result| {
            let Some(continuation) = pending.lock().take() else {
                return;
            };
            if stop_after_first {
                if let Some(ctx) = ctx.upgrade() {
                    if let Err(err) = ctx.scanner.stop_session(session) {
                        warn!("Stopping RSSI scan failed: {}", err);
                    }
                }
            }
            let Some((device, callback)) = continuation.resolve(&registry) else {
                return;
            };
            device.update_from_scan(result);
            callback(result.rssi, &device);
        });

        if self.ctx.scanner.is_scanning() {
            info!("Reading RSSI of {} stops the running scan", self.address);
            self.ctx.events.send(GattEvent::ScanPreempted {
                remote_id: self.address.clone(),
            });
        } else {
            debug!("Reading RSSI of {}", self.address);
        }
        self.ctx
            .scanner
            .start(ScanSettings::for_device(self.address.clone()), handler)?;
        Ok(())
    }

    /// Request an MTU and wait for the outcome.
    pub async fn request_mtu_async(&self, mtu: u32) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.request_mtu(mtu, move |status, mtu, _| {
            let _ = tx.send(status.check("request ATT MTU change").map(|()| mtu));
        })?;
        rx.await.map_err(|_| self.released())?
    }

    /// Read the RSSI and wait for it.
    pub async fn read_rssi_async(&self) -> Result<i16> {
        let (tx, rx) = oneshot::channel();
        self.read_rssi(move |rssi, _| {
            let _ = tx.send(rssi);
        })?;
        rx.await.map_err(|_| self.released())
    }

    /// Owned summary of this device.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let info = self.info.read();
        DeviceSnapshot {
            remote_id: self.address.clone(),
            name: info.name.clone(),
            state: self.state(),
            rssi: info.rssi,
            last_seen: info.last_seen,
        }
    }

    /// Owned export of the current GATT tree.
    pub fn export_services(&self) -> Vec<ServiceSnapshot> {
        self.services.read().iter().map(|s| s.snapshot()).collect()
    }

    fn client(&self, operation: &'static str) -> Result<ClientHandle> {
        let state = self.state();
        if !state.is_connected() {
            return Err(self.invalid_state(operation, state));
        }
        self.ctx.clients.get_or_create(&self.address)
    }

    fn clear_services(&self) {
        let services = std::mem::take(&mut *self.services.write());
        if !services.is_empty() {
            debug!("Dropping GATT tree of {}", self.address);
        }
        drop(services);
    }

    fn invalid_state(&self, operation: &'static str, state: ConnectionState) -> Error {
        Error::InvalidState {
            operation,
            address: self.address.clone(),
            state,
        }
    }

    fn released(&self) -> Error {
        Error::Released {
            target: self.address.clone(),
        }
    }
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        // A controller created later for the same address owns the link and
        // the GATT client now.
        if !self._registration.is_current() {
            debug!("{} was replaced, leaving its link alone", self.address);
            return;
        }
        if let Err(err) = self.disconnect() {
            debug!("Disconnect on drop of {} failed: {}", self.address, err);
        }
        self.ctx.clients.destroy_if_exists(&self.address);
    }
}
