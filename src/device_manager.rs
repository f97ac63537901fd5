//! Device manager: the composition root.
//!
//! Owns every known device, the scan session and the shared context, and is
//! the dispatch target of the native connection-state callback. Requests
//! whose results arrive asynchronously publish them as [`GattEvent`]s.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::ble::btleplug_stack::BtleplugStack;
use crate::ble::native::{
    AdapterState, ConnectionStateCallback, NativeResultExt, NativeStack, NativeStatus,
};
use crate::ble::scanner::{ScanHandler, ScanSettings};
use crate::config::ManagerConfig;
use crate::context::GattContext;
use crate::device::DeviceController;
use crate::error::{Error, Result};
use crate::gatt::{
    Characteristic, CharacteristicPath, Descriptor, DescriptorPath, DeviceSnapshot,
    ServiceSnapshot,
};
use crate::notifications::{spawn_event_callback, CallbackHandle, GattEvent};
use crate::utils::normalize_address;

type DeviceMap = Arc<RwLock<HashMap<String, Arc<DeviceController>>>>;

/// Central manager for devices and their GATT trees.
pub struct DeviceManager {
    /// Shared context handed to every entity.
    ctx: Arc<GattContext>,
    /// Known devices by normalized address.
    devices: DeviceMap,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl DeviceManager {
    /// Create a manager over `stack` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection-state callback cannot be installed.
    pub fn new(stack: Arc<dyn NativeStack>) -> Result<Self> {
        Self::with_config(stack, ManagerConfig::default())
    }

    /// Create a manager over `stack`.
    pub fn with_config(stack: Arc<dyn NativeStack>, config: ManagerConfig) -> Result<Self> {
        let ctx = GattContext::new(stack, config);

        let weak = Arc::downgrade(&ctx);
        let on_state: ConnectionStateCallback = Arc::new(move |status, connected, address| {
            if let Some(ctx) = weak.upgrade() {
                Self::handle_connection_state_changed(&ctx, status, connected, address);
            }
        });
        ctx.stack
            .set_connection_state_changed_cb(on_state)
            .logged("set connection state changed callback")?;

        Ok(Self {
            ctx,
            devices: Arc::new(RwLock::new(HashMap::new())),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Create a manager over the first system Bluetooth adapter.
    ///
    /// Must be called from inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_btleplug(config: ManagerConfig) -> Result<Self> {
        let stack = BtleplugStack::new().await?;
        Self::with_config(Arc::new(stack), config)
    }

    // === Adapter ===

    /// Power state of the adapter.
    pub fn bluetooth_state(&self) -> Result<AdapterState> {
        self.ctx.stack.adapter_state().logged("get adapter state")
    }

    /// Whether the adapter is present and on.
    pub fn is_available(&self) -> bool {
        matches!(self.bluetooth_state(), Ok(AdapterState::Enabled))
    }

    // === Scanning ===

    /// Start a scan, replacing any running one.
    ///
    /// Every accepted report creates or refreshes the device for its address
    /// and is published as [`GattEvent::ScanResult`].
    pub fn start_scan(&self, settings: ScanSettings) -> Result<()> {
        info!("Starting scan");

        let ctx = Arc::downgrade(&self.ctx);
        let devices = Arc::downgrade(&self.devices);
        let handler: ScanHandler = Arc::new(move |_, result| {
            let (Some(ctx), Some(devices)) = (ctx.upgrade(), devices.upgrade()) else {
                return;
            };
            let device = Self::device_entry(&ctx, &devices, &result.address);
            device.update_from_scan(result);
            ctx.events.send(GattEvent::ScanResult(result.clone()));
        });

        self.ctx.scanner.start(settings, handler)?;
        Ok(())
    }

    /// Stop scanning.
    pub fn stop_scan(&self) -> Result<()> {
        self.ctx.scanner.stop()
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.ctx.scanner.is_scanning()
    }

    // === Devices ===

    /// Get a device by address.
    pub fn device(&self, address: &str) -> Option<Arc<DeviceController>> {
        self.devices.read().get(&normalize_address(address)).cloned()
    }

    /// All known devices, ordered by address.
    pub fn devices(&self) -> Vec<Arc<DeviceController>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.address().cmp(b.address()));
        devices
    }

    /// Get the number of known devices.
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Summaries of the connected devices.
    pub fn connected_devices(&self) -> Vec<DeviceSnapshot> {
        self.devices()
            .iter()
            .filter(|d| d.is_connected())
            .map(|d| d.snapshot())
            .collect()
    }

    /// Connect to `address`, creating its device if it was never seen.
    pub fn connect(&self, address: &str, auto_connect: bool) -> Result<()> {
        Self::device_entry(&self.ctx, &self.devices, address).connect(auto_connect)
    }

    /// Disconnect from `address`.
    pub fn disconnect(&self, address: &str) -> Result<()> {
        self.require_device(address)?.disconnect()
    }

    /// Drop the manager's ownership of a device.
    ///
    /// Returns whether the device was known. Once no caller holds it any
    /// more it disconnects and leaves the registry.
    pub fn release_device(&self, address: &str) -> bool {
        let removed = self.devices.write().remove(&normalize_address(address));
        if let Some(device) = &removed {
            debug!("Releasing device {}", device.address());
        }
        removed.is_some()
    }

    // === GATT ===

    /// Rebuild a device's GATT tree and export it.
    ///
    /// The export is also published as [`GattEvent::ServicesDiscovered`].
    pub fn discover_services(&self, address: &str) -> Result<Vec<ServiceSnapshot>> {
        let device = self.require_device(address)?;
        device.discover_services()?;

        let services = device.export_services();
        self.ctx.events.send(GattEvent::ServicesDiscovered {
            remote_id: device.address().to_string(),
            services: services.clone(),
        });
        Ok(services)
    }

    /// Export a device's current GATT tree without rediscovering.
    pub fn services(&self, address: &str) -> Result<Vec<ServiceSnapshot>> {
        Ok(self.require_device(address)?.export_services())
    }

    /// Find a live characteristic.
    pub fn locate_characteristic(&self, path: &CharacteristicPath) -> Result<Arc<Characteristic>> {
        self.require_device(&path.remote_id)?
            .locate_characteristic(path)
    }

    /// Find a live descriptor.
    pub fn locate_descriptor(&self, path: &DescriptorPath) -> Result<Arc<Descriptor>> {
        self.require_device(&path.characteristic.remote_id)?
            .locate_descriptor(path)
    }

    /// Read a characteristic; the result arrives as
    /// [`GattEvent::CharacteristicRead`].
    pub fn read_characteristic(&self, path: &CharacteristicPath) -> Result<()> {
        let events = self.ctx.events.clone();
        self.locate_characteristic(path)?.read(move |status, characteristic| {
            events.send(GattEvent::CharacteristicRead {
                characteristic: characteristic.snapshot(),
                status,
            });
        })
    }

    /// Write a characteristic; the result arrives as
    /// [`GattEvent::CharacteristicWritten`].
    pub fn write_characteristic(
        &self,
        path: &CharacteristicPath,
        value: &[u8],
        without_response: bool,
    ) -> Result<()> {
        let events = self.ctx.events.clone();
        self.locate_characteristic(path)?
            .write(value, without_response, move |success, characteristic| {
                events.send(GattEvent::CharacteristicWritten {
                    characteristic: characteristic.snapshot(),
                    success,
                });
            })
    }

    /// Read a descriptor; the result arrives as [`GattEvent::DescriptorRead`].
    pub fn read_descriptor(&self, path: &DescriptorPath) -> Result<()> {
        let events = self.ctx.events.clone();
        self.locate_descriptor(path)?.read(move |status, descriptor| {
            events.send(GattEvent::DescriptorRead {
                descriptor: descriptor.snapshot(),
                status,
            });
        })
    }

    /// Write a descriptor; the result arrives as
    /// [`GattEvent::DescriptorWritten`].
    pub fn write_descriptor(&self, path: &DescriptorPath, value: &[u8]) -> Result<()> {
        let events = self.ctx.events.clone();
        self.locate_descriptor(path)?
            .write(value, move |success, descriptor| {
                events.send(GattEvent::DescriptorWritten {
                    descriptor: descriptor.snapshot(),
                    success,
                });
            })
    }

    /// Switch notifications on or off.
    ///
    /// While on, every value change is published as
    /// [`GattEvent::CharacteristicChanged`].
    pub fn set_notification(&self, path: &CharacteristicPath, enable: bool) -> Result<()> {
        let characteristic = self.locate_characteristic(path)?;

        if enable {
            let events = self.ctx.events.clone();
            characteristic.set_notify_callback(move |characteristic| {
                events.send(GattEvent::CharacteristicChanged {
                    characteristic: characteristic.snapshot(),
                });
            })?;
        } else {
            characteristic.unset_notify_callback()?;
        }

        self.ctx.events.send(GattEvent::NotificationStateChanged {
            characteristic: characteristic.snapshot(),
            enabled: enable,
        });
        Ok(())
    }

    /// Current ATT MTU of a device.
    pub fn mtu(&self, address: &str) -> Result<u32> {
        self.require_device(address)?.mtu()
    }

    /// Request an MTU; the result arrives as [`GattEvent::MtuChanged`].
    pub fn request_mtu(&self, address: &str, mtu: u32) -> Result<()> {
        let events = self.ctx.events.clone();
        self.require_device(address)?
            .request_mtu(mtu, move |status, mtu, device| {
                events.send(GattEvent::MtuChanged {
                    remote_id: device.address().to_string(),
                    mtu,
                    success: status.is_ok(),
                });
            })
    }

    /// Read the RSSI; the result arrives as [`GattEvent::RssiRead`].
    ///
    /// Replaces any running scan.
    pub fn read_rssi(&self, address: &str) -> Result<()> {
        let events = self.ctx.events.clone();
        self.require_device(address)?.read_rssi(move |rssi, device| {
            events.send(GattEvent::RssiRead {
                remote_id: device.address().to_string(),
                rssi,
            });
        })
    }

    // === Events ===

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<GattEvent> {
        self.ctx.events.subscribe()
    }

    /// Register a callback for every event.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(GattEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        spawn_event_callback(callback_id, self.ctx.events.subscribe(), callback)
    }

    /// Clean shutdown of all connections and scanning.
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.stop_scan()?;

        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        for device in devices {
            if let Err(e) = device.disconnect() {
                warn!("Error disconnecting {}: {}", device.address(), e);
            }
        }

        let devices = std::mem::take(&mut *self.devices.write());
        drop(devices);
        Ok(())
    }

    fn require_device(&self, address: &str) -> Result<Arc<DeviceController>> {
        self.device(address).ok_or_else(|| Error::DeviceNotFound {
            address: normalize_address(address),
        })
    }

    /// Get or create the device for `address`. At most one exists per address.
    ///
    /// A released device that a caller still holds is taken back instead of
    /// being shadowed by a second controller.
    fn device_entry(ctx: &Arc<GattContext>, devices: &DeviceMap, address: &str) -> Arc<DeviceController> {
        let address = normalize_address(address);
        if let Some(device) = devices.read().get(&address) {
            return device.clone();
        }

        devices
            .write()
            .entry(address)
            .or_insert_with_key(|address| match ctx.devices.lookup(address) {
                Some(device) => {
                    debug!("Taking back released device {}", address);
                    device
                }
                None => {
                    info!("New device {}", address);
                    DeviceController::new(ctx, address)
                }
            })
            .clone()
    }

    /// Route a native connection-state report to its device.
    fn handle_connection_state_changed(
        ctx: &Arc<GattContext>,
        status: NativeStatus,
        connected: bool,
        address: &str,
    ) {
        let address = normalize_address(address);
        let Some(device) = ctx.devices.lookup(&address) else {
            trace!("Connection state for unknown device {}", address);
            return;
        };

        device.handle_connection_state_changed(status, connected);
        ctx.events.send(GattEvent::DeviceStateChanged {
            remote_id: address,
            state: device.state(),
            status,
        });
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Err(status) = self.ctx.stack.unset_connection_state_changed_cb() {
            debug!("Unset connection state callback failed: {}", status);
        }
        if let Err(err) = self.ctx.scanner.stop() {
            debug!("Stop scan on drop failed: {}", err);
        }
    }
}
