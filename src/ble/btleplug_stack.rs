//! [`NativeStack`] backend on top of btleplug.
//!
//! btleplug is async; the native boundary is handle-based with completion
//! callbacks. Synchronous calls answer from tables filled by the last
//! service discovery, and requests are spawned on the tokio runtime that
//! created the stack, firing their callbacks from its worker threads.
//!
//! btleplug exposes neither the ATT MTU nor included services, so MTU calls
//! report [`NativeStatus::NOT_SUPPORTED`] and included services enumerate as
//! empty.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic as BtleCharacteristic,
    Descriptor as BtleDescriptor, Manager as _, Peripheral as _, ScanFilter as BtleScanFilter,
    Service as BtleService, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::native::{
    AdapterState, AdvertisementData, ClientHandle, ConnectionStateCallback, GattHandle,
    HandleVisitor, MtuChangedCallback, NativeResult, NativeStack, NativeStatus, RequestCallback,
    ScanFilter, ScanResult, ScanResultCallback, ValueChangedCallback, WriteType,
};
use crate::error::{Error, Result};

/// Reported when the platform gives no RSSI for an advertisement.
const UNKNOWN_RSSI: i16 = -127;

#[derive(Clone)]
enum Attribute {
    Service {
        address: String,
        service: BtleService,
    },
    Characteristic {
        address: String,
        characteristic: BtleCharacteristic,
    },
    Descriptor {
        address: String,
        descriptor: BtleDescriptor,
    },
}

impl Attribute {
    fn address(&self) -> &str {
        match self {
            Self::Service { address, .. }
            | Self::Characteristic { address, .. }
            | Self::Descriptor { address, .. } => address,
        }
    }

    fn uuid(&self) -> Uuid {
        match self {
            Self::Service { service, .. } => service.uuid,
            Self::Characteristic { characteristic, .. } => characteristic.uuid,
            Self::Descriptor { descriptor, .. } => descriptor.uuid,
        }
    }
}

#[derive(Default)]
struct Inner {
    peripherals: RwLock<HashMap<String, Peripheral>>,
    addresses: RwLock<HashMap<PeripheralId, String>>,
    connected: Mutex<HashSet<String>>,
    clients: Mutex<HashMap<ClientHandle, String>>,
    attributes: RwLock<HashMap<GattHandle, Attribute>>,
    values: Mutex<HashMap<GattHandle, Vec<u8>>>,
    write_types: Mutex<HashMap<GattHandle, WriteType>>,
    value_changed: Mutex<HashMap<GattHandle, Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    scan_cb: RwLock<Option<ScanResultCallback>>,
    connection_cb: RwLock<Option<ConnectionStateCallback>>,
    powered_off: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn allocate(&self, attribute: Attribute) -> GattHandle {
        let handle = GattHandle(self.next_id());
        self.attributes.write().insert(handle, attribute);
        handle
    }

    fn attribute(&self, handle: GattHandle) -> NativeResult<Attribute> {
        self.attributes
            .read()
            .get(&handle)
            .cloned()
            .ok_or(NativeStatus::INVALID_PARAMETER)
    }

    fn peripheral(&self, address: &str) -> NativeResult<Peripheral> {
        self.peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or(NativeStatus::NOT_FOUND)
    }

    fn client_address(&self, client: ClientHandle) -> NativeResult<String> {
        self.clients
            .lock()
            .get(&client)
            .cloned()
            .ok_or(NativeStatus::INVALID_PARAMETER)
    }

    /// Report a link change once per transition.
    fn report_connection(&self, status: NativeStatus, connected: bool, address: &str) {
        let changed = {
            let mut links = self.connected.lock();
            if connected {
                links.insert(address.to_string())
            } else {
                links.remove(address)
            }
        };
        if !changed && status.is_ok() {
            trace!("Duplicate link report for {}", address);
            return;
        }

        let callback = self.connection_cb.read().clone();
        if let Some(callback) = callback {
            callback(status, connected, address);
        }
    }

    /// Drop every handle issued for `address` along with its staged state.
    fn forget_attributes(&self, address: &str) {
        self.attributes
            .write()
            .retain(|_, attribute| attribute.address() != address);
        let live: HashSet<GattHandle> = self.attributes.read().keys().copied().collect();
        self.values.lock().retain(|handle, _| live.contains(handle));
        self.write_types.lock().retain(|handle, _| live.contains(handle));
        self.value_changed.lock().retain(|handle, _| live.contains(handle));
    }

    fn forget(&self, address: &str) {
        self.forget_attributes(address);
        if let Some(pump) = self.pumps.lock().remove(address) {
            pump.abort();
        }
    }

    fn deliver_notification(&self, address: &str, uuid: Uuid, value: &[u8]) {
        let handles: Vec<GattHandle> = self
            .attributes
            .read()
            .iter()
            .filter(|(_, attribute)| {
                matches!(attribute, Attribute::Characteristic { .. })
                    && attribute.address() == address
                    && attribute.uuid() == uuid
            })
            .map(|(handle, _)| *handle)
            .collect();

        for handle in handles {
            let callback = self.value_changed.lock().get(&handle).cloned();
            if let Some(callback) = callback {
                self.values.lock().insert(handle, value.to_vec());
                callback(value);
            }
        }
    }

    async fn handle_event(&self, adapter: &Adapter, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                self.process_peripheral(adapter, id).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let address = self.addresses.read().get(&id).cloned();
                if let Some(address) = address {
                    self.report_connection(NativeStatus::OK, false, &address);
                }
            }
            CentralEvent::StateUpdate(state) => {
                info!("Adapter state: {:?}", state);
                self.powered_off
                    .store(matches!(state, CentralState::PoweredOff), Ordering::SeqCst);
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    async fn process_peripheral(&self, adapter: &Adapter, id: PeripheralId) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = properties.address.to_string();
        self.addresses.write().insert(id, address.clone());
        self.peripherals
            .write()
            .insert(address.clone(), peripheral);

        let Some(callback) = self.scan_cb.read().clone() else {
            return;
        };

        callback(
            NativeStatus::OK,
            ScanResult {
                address,
                name: properties.local_name.clone(),
                rssi: properties.rssi.unwrap_or(UNKNOWN_RSSI),
                advertisement: AdvertisementData {
                    local_name: properties.local_name,
                    manufacturer_data: properties.manufacturer_data,
                    service_data: properties.service_data,
                    service_uuids: properties.services,
                    tx_power_level: properties.tx_power_level,
                    connectable: false,
                },
            },
        );
    }
}

fn status_of(err: &btleplug::Error) -> NativeStatus {
    match err {
        btleplug::Error::PermissionDenied => NativeStatus::PERMISSION_DENIED,
        btleplug::Error::DeviceNotFound | btleplug::Error::NoSuchCharacteristic => {
            NativeStatus::NOT_FOUND
        }
        btleplug::Error::NotConnected => NativeStatus::NOT_CONNECTED,
        btleplug::Error::NotSupported(_) => NativeStatus::NOT_SUPPORTED,
        btleplug::Error::TimedOut(_) => NativeStatus::TIMED_OUT,
        _ => NativeStatus::OPERATION_FAILED,
    }
}

fn status_from<T>(operation: &str, result: btleplug::Result<T>) -> NativeStatus {
    match result {
        Ok(_) => NativeStatus::OK,
        Err(e) => {
            warn!("{} failed: {}", operation, e);
            status_of(&e)
        }
    }
}

/// Native stack over the first system Bluetooth adapter.
pub struct BtleplugStack {
    adapter: Adapter,
    runtime: Handle,
    inner: Arc<Inner>,
    event_task: JoinHandle<()>,
}

impl BtleplugStack {
    /// Open the first adapter and start listening to its events.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Wrap a specific adapter. Must be called from inside a tokio runtime.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let inner = Arc::new(Inner::default());

        let event_adapter = adapter.clone();
        let event_inner = Arc::downgrade(&inner);
        let event_task = tokio::spawn(async move {
            let mut events = match event_adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let Some(inner) = event_inner.upgrade() else {
                    break;
                };
                inner.handle_event(&event_adapter, event).await;
            }

            debug!("Adapter event loop ended");
        });

        Self {
            adapter,
            runtime: Handle::current(),
            inner,
            event_task,
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn enumerate(&self, attributes: Vec<Attribute>, visitor: HandleVisitor<'_>) {
        let total = attributes.len();
        for (index, attribute) in attributes.into_iter().enumerate() {
            let handle = self.inner.allocate(attribute);
            if !visitor(total, index, handle) {
                break;
            }
        }
    }

    fn ensure_pump(&self, address: &str, peripheral: Peripheral) {
        let mut pumps = self.inner.pumps.lock();
        if pumps.contains_key(address) {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let pump_address = address.to_string();
        let pump = self.runtime.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                trace!(
                    "Notification from {} on {}: {} bytes",
                    pump_address,
                    notification.uuid,
                    notification.value.len()
                );
                inner.deliver_notification(&pump_address, notification.uuid, &notification.value);
            }

            debug!("Notification pump for {} ended", pump_address);
        });
        pumps.insert(address.to_string(), pump);
    }
}

impl NativeStack for BtleplugStack {
    fn adapter_state(&self) -> NativeResult<AdapterState> {
        Ok(if self.inner.powered_off.load(Ordering::SeqCst) {
            AdapterState::Disabled
        } else {
            AdapterState::Enabled
        })
    }

    fn start_scan(&self, filter: &ScanFilter, on_result: ScanResultCallback) -> NativeResult<()> {
        *self.inner.scan_cb.write() = Some(on_result);

        let adapter = self.adapter.clone();
        let filter = BtleScanFilter {
            services: filter.service_uuids.clone(),
        };
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> NativeResult<()> {
        self.inner.scan_cb.write().take();

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn set_connection_state_changed_cb(&self, callback: ConnectionStateCallback) -> NativeResult<()> {
        *self.inner.connection_cb.write() = Some(callback);
        Ok(())
    }

    fn unset_connection_state_changed_cb(&self) -> NativeResult<()> {
        self.inner.connection_cb.write().take();
        Ok(())
    }

    fn connect(&self, address: &str, auto_connect: bool) -> NativeResult<()> {
        if auto_connect {
            debug!("Auto-connect is not available, connecting directly");
        }
        let peripheral = self.inner.peripheral(address)?;
        let inner = self.inner.clone();
        let address = address.to_string();

        self.runtime.spawn(async move {
            let mut status = status_from("connect", peripheral.connect().await);
            if status.is_ok() {
                status = status_from("discover services", peripheral.discover_services().await);
            }
            inner.report_connection(status, status.is_ok(), &address);
        });
        Ok(())
    }

    fn disconnect(&self, address: &str) -> NativeResult<()> {
        let peripheral = self.inner.peripheral(address)?;
        let inner = self.inner.clone();
        let address = address.to_string();

        self.runtime.spawn(async move {
            let status = status_from("disconnect", peripheral.disconnect().await);
            let connected = !status.is_ok() && peripheral.is_connected().await.unwrap_or(false);
            inner.report_connection(status, connected, &address);
        });
        Ok(())
    }

    fn create_client(&self, address: &str) -> NativeResult<ClientHandle> {
        self.inner.peripheral(address)?;
        let client = ClientHandle(self.inner.next_id());
        self.inner.clients.lock().insert(client, address.to_string());
        Ok(client)
    }

    fn destroy_client(&self, client: ClientHandle) -> NativeResult<()> {
        let address = self
            .inner
            .clients
            .lock()
            .remove(&client)
            .ok_or(NativeStatus::INVALID_PARAMETER)?;
        self.inner.forget(&address);
        Ok(())
    }

    fn foreach_services(&self, client: ClientHandle, visitor: HandleVisitor<'_>) -> NativeResult<()> {
        let address = self.inner.client_address(client)?;
        let peripheral = self.inner.peripheral(&address)?;

        // Every pass rebuilds the tree, so handles from the last one are dead.
        self.inner.forget_attributes(&address);

        let services = peripheral
            .services()
            .into_iter()
            .filter(|service| service.primary)
            .map(|service| Attribute::Service {
                address: address.clone(),
                service,
            })
            .collect();
        self.enumerate(services, visitor);
        Ok(())
    }

    fn foreach_included_services(
        &self,
        service: GattHandle,
        _visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        self.inner.attribute(service)?;
        Ok(())
    }

    fn foreach_characteristics(
        &self,
        service: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        let Attribute::Service { address, service } = self.inner.attribute(service)? else {
            return Err(NativeStatus::INVALID_PARAMETER);
        };

        let characteristics = service
            .characteristics
            .into_iter()
            .map(|characteristic| Attribute::Characteristic {
                address: address.clone(),
                characteristic,
            })
            .collect();
        self.enumerate(characteristics, visitor);
        Ok(())
    }

    fn foreach_descriptors(
        &self,
        characteristic: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        let Attribute::Characteristic {
            address,
            characteristic,
        } = self.inner.attribute(characteristic)?
        else {
            return Err(NativeStatus::INVALID_PARAMETER);
        };

        let descriptors = characteristic
            .descriptors
            .into_iter()
            .map(|descriptor| Attribute::Descriptor {
                address: address.clone(),
                descriptor,
            })
            .collect();
        self.enumerate(descriptors, visitor);
        Ok(())
    }

    fn uuid(&self, handle: GattHandle) -> NativeResult<Uuid> {
        Ok(self.inner.attribute(handle)?.uuid())
    }

    fn value(&self, handle: GattHandle) -> NativeResult<Vec<u8>> {
        self.inner.attribute(handle)?;
        Ok(self
            .inner
            .values
            .lock()
            .get(&handle)
            .cloned()
            .unwrap_or_default())
    }

    fn set_value(&self, handle: GattHandle, value: &[u8]) -> NativeResult<()> {
        self.inner.attribute(handle)?;
        self.inner.values.lock().insert(handle, value.to_vec());
        Ok(())
    }

    fn properties(&self, characteristic: GattHandle) -> NativeResult<u32> {
        match self.inner.attribute(characteristic)? {
            Attribute::Characteristic { characteristic, .. } => {
                Ok(u32::from(characteristic.properties.bits()))
            }
            _ => Err(NativeStatus::INVALID_PARAMETER),
        }
    }

    fn set_write_type(&self, characteristic: GattHandle, write_type: WriteType) -> NativeResult<()> {
        self.inner.attribute(characteristic)?;
        self.inner.write_types.lock().insert(characteristic, write_type);
        Ok(())
    }

    fn read_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()> {
        let attribute = self.inner.attribute(handle)?;
        let peripheral = self.inner.peripheral(attribute.address())?;
        let inner = self.inner.clone();

        self.runtime.spawn(async move {
            let result = match &attribute {
                Attribute::Characteristic { characteristic, .. } => {
                    peripheral.read(characteristic).await
                }
                Attribute::Descriptor { descriptor, .. } => {
                    peripheral.read_descriptor(descriptor).await
                }
                Attribute::Service { .. } => {
                    on_complete(NativeStatus::INVALID_PARAMETER);
                    return;
                }
            };

            let status = match result {
                Ok(value) => {
                    inner.values.lock().insert(handle, value);
                    NativeStatus::OK
                }
                Err(e) => {
                    warn!("read {} failed: {}", attribute.uuid(), e);
                    status_of(&e)
                }
            };
            on_complete(status);
        });
        Ok(())
    }

    fn write_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()> {
        let attribute = self.inner.attribute(handle)?;
        let peripheral = self.inner.peripheral(attribute.address())?;
        let value = self
            .inner
            .values
            .lock()
            .get(&handle)
            .cloned()
            .unwrap_or_default();
        let write_type = match self.inner.write_types.lock().get(&handle) {
            Some(WriteType::WithoutResponse) => BtleWriteType::WithoutResponse,
            _ => BtleWriteType::WithResponse,
        };

        self.runtime.spawn(async move {
            let status = match &attribute {
                Attribute::Characteristic { characteristic, .. } => status_from(
                    "write characteristic",
                    peripheral.write(characteristic, &value, write_type).await,
                ),
                Attribute::Descriptor { descriptor, .. } => status_from(
                    "write descriptor",
                    peripheral.write_descriptor(descriptor, &value).await,
                ),
                Attribute::Service { .. } => NativeStatus::INVALID_PARAMETER,
            };
            on_complete(status);
        });
        Ok(())
    }

    fn set_value_changed_cb(
        &self,
        characteristic: GattHandle,
        callback: ValueChangedCallback,
    ) -> NativeResult<()> {
        let Attribute::Characteristic {
            address,
            characteristic: target,
        } = self.inner.attribute(characteristic)?
        else {
            return Err(NativeStatus::INVALID_PARAMETER);
        };
        let peripheral = self.inner.peripheral(&address)?;

        self.inner
            .value_changed
            .lock()
            .insert(characteristic, Arc::from(callback));
        self.ensure_pump(&address, peripheral.clone());

        self.runtime.spawn(async move {
            if let Err(e) = peripheral.subscribe(&target).await {
                warn!("Failed to subscribe to {}: {}", target.uuid, e);
            }
        });
        Ok(())
    }

    fn unset_value_changed_cb(&self, characteristic: GattHandle) -> NativeResult<()> {
        self.inner.value_changed.lock().remove(&characteristic);

        let Attribute::Characteristic {
            address,
            characteristic: target,
        } = self.inner.attribute(characteristic)?
        else {
            return Err(NativeStatus::INVALID_PARAMETER);
        };
        let peripheral = self.inner.peripheral(&address)?;

        self.runtime.spawn(async move {
            if let Err(e) = peripheral.unsubscribe(&target).await {
                debug!("Failed to unsubscribe from {}: {}", target.uuid, e);
            }
        });
        Ok(())
    }

    fn att_mtu(&self, _client: ClientHandle) -> NativeResult<u32> {
        Err(NativeStatus::NOT_SUPPORTED)
    }

    fn set_att_mtu_changed_cb(
        &self,
        _client: ClientHandle,
        _callback: MtuChangedCallback,
    ) -> NativeResult<()> {
        Err(NativeStatus::NOT_SUPPORTED)
    }

    fn unset_att_mtu_changed_cb(&self, _client: ClientHandle) -> NativeResult<()> {
        Err(NativeStatus::NOT_SUPPORTED)
    }

    fn request_att_mtu_change(&self, _client: ClientHandle, _mtu: u32) -> NativeResult<()> {
        Err(NativeStatus::NOT_SUPPORTED)
    }
}

impl Drop for BtleplugStack {
    fn drop(&mut self) {
        self.event_task.abort();
        for (_, pump) in self.inner.pumps.lock().drain() {
            pump.abort();
        }
    }
}
