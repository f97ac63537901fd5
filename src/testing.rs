//! In-memory native stack for tests.
//!
//! Holds a GATT profile per address, records every native call, and queues
//! asynchronous requests until a test completes them. Callbacks are always
//! invoked after the internal lock is released so they may call back in.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::ble::native::{
    AdapterState, AdvertisementData, ClientHandle, ConnectionStateCallback, GattHandle,
    HandleVisitor, MtuChangedCallback, NativeResult, NativeStack, NativeStatus, RequestCallback,
    ScanFilter, ScanResult, ScanResultCallback, ValueChangedCallback, WriteType,
};
use crate::ble::uuids::uuid_from_u16;
use crate::config::ManagerConfig;
use crate::context::GattContext;
use crate::device::DeviceController;
use crate::gatt::{Characteristic, CharacteristicPath, ServicePath};

/// Default ATT MTU before any exchange.
pub(crate) const DEFAULT_MTU: u32 = 23;

pub(crate) const TEST_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
pub(crate) const HEART_RATE: Uuid = uuid_from_u16(0x180d);
pub(crate) const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
pub(crate) const CLIENT_CONFIG: Uuid = uuid_from_u16(0x2902);

/// Context over a fake stack with default configuration.
pub(crate) fn context(stack: &Arc<FakeStack>) -> Arc<GattContext> {
    GattContext::new(stack.clone(), ManagerConfig::default())
}

/// A controller for [`TEST_ADDRESS`] that went through a successful connect.
pub(crate) fn connected_device(ctx: &Arc<GattContext>) -> Arc<DeviceController> {
    let device = DeviceController::new(ctx, TEST_ADDRESS);
    device.connect(false).unwrap();
    device.handle_connection_state_changed(NativeStatus::OK, true);
    device
}

pub(crate) fn scan_result(address: &str, rssi: i16) -> ScanResult {
    ScanResult {
        address: address.to_string(),
        name: Some("Sensor".to_string()),
        rssi,
        advertisement: AdvertisementData {
            connectable: true,
            ..Default::default()
        },
    }
}

/// Native handles of the single-characteristic profile.
pub(crate) struct Profile {
    pub(crate) characteristic: GattHandle,
    pub(crate) descriptor: GattHandle,
}

/// Everything a characteristic-level test needs.
pub(crate) struct Fixture {
    pub(crate) stack: Arc<FakeStack>,
    pub(crate) ctx: Arc<GattContext>,
    pub(crate) device: Arc<DeviceController>,
    pub(crate) characteristic: Arc<Characteristic>,
    pub(crate) profile: Profile,
}

/// Heart rate service with one measurement characteristic carrying
/// `properties` and one client configuration descriptor, connected and
/// discovered.
pub(crate) fn discovered(properties: u32) -> Fixture {
    let stack = Arc::new(FakeStack::new());
    let service = stack.add_service(TEST_ADDRESS, HEART_RATE);
    let characteristic = stack.add_characteristic(service, HEART_RATE_MEASUREMENT, properties);
    let descriptor = stack.add_descriptor(characteristic, CLIENT_CONFIG);

    let ctx = context(&stack);
    let device = connected_device(&ctx);
    device.discover_services().unwrap();
    let path = CharacteristicPath::new(
        TEST_ADDRESS,
        ServicePath::primary(HEART_RATE),
        HEART_RATE_MEASUREMENT,
    );
    let characteristic_entity = device.locate_characteristic(&path).unwrap();

    Fixture {
        stack,
        ctx,
        device,
        characteristic: characteristic_entity,
        profile: Profile {
            characteristic,
            descriptor,
        },
    }
}

#[derive(Default)]
struct FakeAttribute {
    uuid: Uuid,
    properties: u32,
    value: Vec<u8>,
    remote_value: Option<Vec<u8>>,
    write_type: WriteType,
    children: Vec<GattHandle>,
    included: Vec<GattHandle>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    attributes: HashMap<GattHandle, FakeAttribute>,
    profiles: HashMap<String, Vec<GattHandle>>,
    clients: HashMap<ClientHandle, String>,
    adapter_enabled: bool,
    connection_cb: Option<ConnectionStateCallback>,
    scan_cb: Option<ScanResultCallback>,
    scan_filter: Option<ScanFilter>,
    pending_reads: Vec<(GattHandle, RequestCallback)>,
    pending_writes: Vec<(GattHandle, RequestCallback)>,
    mtu: HashMap<ClientHandle, u32>,
    requested_mtu: HashMap<ClientHandle, u32>,
    mtu_callbacks: Vec<(ClientHandle, MtuChangedCallback)>,
    value_changed: HashMap<GattHandle, Arc<dyn Fn(&[u8]) + Send + Sync>>,
    failures: HashMap<&'static str, NativeStatus>,
    calls: Vec<(&'static str, String)>,
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_attribute(&mut self, uuid: Uuid, properties: u32) -> GattHandle {
        let handle = GattHandle(self.next_id());
        self.attributes.insert(
            handle,
            FakeAttribute {
                uuid,
                properties,
                ..Default::default()
            },
        );
        handle
    }

    fn attribute(&mut self, handle: GattHandle) -> NativeResult<&mut FakeAttribute> {
        self.attributes
            .get_mut(&handle)
            .ok_or(NativeStatus::INVALID_PARAMETER)
    }
}

/// Scriptable in-memory [`NativeStack`].
pub(crate) struct FakeStack {
    state: Mutex<FakeState>,
}

impl FakeStack {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                adapter_enabled: true,
                ..Default::default()
            }),
        }
    }

    // === Profile building ===

    pub(crate) fn add_service(&self, address: &str, uuid: Uuid) -> GattHandle {
        let mut state = self.state.lock();
        let handle = state.add_attribute(uuid, 0);
        state
            .profiles
            .entry(address.to_string())
            .or_default()
            .push(handle);
        handle
    }

    pub(crate) fn add_included_service(&self, primary: GattHandle, uuid: Uuid) -> GattHandle {
        let mut state = self.state.lock();
        let handle = state.add_attribute(uuid, 0);
        if let Some(service) = state.attributes.get_mut(&primary) {
            service.included.push(handle);
        }
        handle
    }

    pub(crate) fn add_characteristic(
        &self,
        service: GattHandle,
        uuid: Uuid,
        properties: u32,
    ) -> GattHandle {
        let mut state = self.state.lock();
        let handle = state.add_attribute(uuid, properties);
        if let Some(service) = state.attributes.get_mut(&service) {
            service.children.push(handle);
        }
        handle
    }

    pub(crate) fn add_descriptor(&self, characteristic: GattHandle, uuid: Uuid) -> GattHandle {
        let mut state = self.state.lock();
        let handle = state.add_attribute(uuid, 0);
        if let Some(characteristic) = state.attributes.get_mut(&characteristic) {
            characteristic.children.push(handle);
        }
        handle
    }

    /// Value the next successful read of `handle` returns.
    pub(crate) fn set_remote_value(&self, handle: GattHandle, value: &[u8]) {
        if let Some(attribute) = self.state.lock().attributes.get_mut(&handle) {
            attribute.remote_value = Some(value.to_vec());
        }
    }

    pub(crate) fn set_adapter_enabled(&self, enabled: bool) {
        self.state.lock().adapter_enabled = enabled;
    }

    // === Failure injection and inspection ===

    /// Make every call to `operation` fail with `status`.
    pub(crate) fn fail(&self, operation: &'static str, status: NativeStatus) {
        self.state.lock().failures.insert(operation, status);
    }

    pub(crate) fn clear_failure(&self, operation: &'static str) {
        self.state.lock().failures.remove(operation);
    }

    pub(crate) fn calls_named(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(name, _)| *name == operation)
            .count()
    }

    pub(crate) fn last_call_detail(&self, operation: &str) -> Option<String> {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find(|(name, _)| *name == operation)
            .map(|(_, detail)| detail.clone())
    }

    pub(crate) fn value_of(&self, handle: GattHandle) -> Vec<u8> {
        self.state
            .lock()
            .attributes
            .get(&handle)
            .map(|a| a.value.clone())
            .unwrap_or_default()
    }

    pub(crate) fn write_type_of(&self, handle: GattHandle) -> Option<WriteType> {
        self.state.lock().attributes.get(&handle).map(|a| a.write_type)
    }

    pub(crate) fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub(crate) fn has_value_changed_cb(&self, handle: GattHandle) -> bool {
        self.state.lock().value_changed.contains_key(&handle)
    }

    pub(crate) fn pending_reads(&self) -> usize {
        self.state.lock().pending_reads.len()
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.state.lock().pending_writes.len()
    }

    pub(crate) fn scan_filter(&self) -> Option<ScanFilter> {
        self.state.lock().scan_filter.clone()
    }

    // === Callback delivery ===

    pub(crate) fn fire_connection_state(&self, status: NativeStatus, connected: bool, address: &str) {
        let callback = self.state.lock().connection_cb.clone();
        if let Some(callback) = callback {
            callback(status, connected, address);
        }
    }

    pub(crate) fn emit_scan_result(&self, status: NativeStatus, result: ScanResult) {
        let callback = self.state.lock().scan_cb.clone();
        if let Some(callback) = callback {
            callback(status, result);
        }
    }

    /// Complete every queued read with `status`. Returns how many ran.
    pub(crate) fn complete_reads(&self, status: NativeStatus) -> usize {
        let pending = {
            let mut state = self.state.lock();
            let pending: Vec<_> = state.pending_reads.drain(..).collect();
            if status.is_ok() {
                for (handle, _) in &pending {
                    if let Some(attribute) = state.attributes.get_mut(handle) {
                        if let Some(remote) = attribute.remote_value.clone() {
                            attribute.value = remote;
                        }
                    }
                }
            }
            pending
        };

        let count = pending.len();
        for (_, callback) in pending {
            callback(status);
        }
        count
    }

    /// Complete every queued write with `status`. Returns how many ran.
    pub(crate) fn complete_writes(&self, status: NativeStatus) -> usize {
        let pending: Vec<_> = self.state.lock().pending_writes.drain(..).collect();
        let count = pending.len();
        for (_, callback) in pending {
            callback(status);
        }
        count
    }

    /// Complete every queued MTU exchange with `status`.
    pub(crate) fn complete_mtu_requests(&self, status: NativeStatus) -> usize {
        let pending = {
            let mut state = self.state.lock();
            let callbacks: Vec<_> = state.mtu_callbacks.drain(..).collect();
            let mut pending = Vec::new();
            for (client, callback) in callbacks {
                if status.is_ok() {
                    if let Some(requested) = state.requested_mtu.remove(&client) {
                        state.mtu.insert(client, requested);
                    }
                }
                let mtu = state.mtu.get(&client).copied().unwrap_or(DEFAULT_MTU);
                pending.push((mtu, callback));
            }
            pending
        };

        let count = pending.len();
        for (mtu, callback) in pending {
            callback(status, mtu);
        }
        count
    }

    /// Deliver a notification. Returns whether a callback was installed.
    pub(crate) fn emit_value_changed(&self, handle: GattHandle, value: &[u8]) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if let Some(attribute) = state.attributes.get_mut(&handle) {
                attribute.value = value.to_vec();
            }
            state.value_changed.get(&handle).cloned()
        };
        match callback {
            Some(callback) => {
                callback(value);
                true
            }
            None => false,
        }
    }

    fn enter(&self, operation: &'static str, detail: String) -> NativeResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock();
        state.calls.push((operation, detail));
        match state.failures.get(operation) {
            Some(status) => Err(*status),
            None => Ok(state),
        }
    }

    fn enumerate(handles: Vec<GattHandle>, visitor: HandleVisitor<'_>) -> NativeResult<()> {
        let total = handles.len();
        for (index, handle) in handles.into_iter().enumerate() {
            if !visitor(total, index, handle) {
                break;
            }
        }
        Ok(())
    }
}

impl NativeStack for FakeStack {
    fn adapter_state(&self) -> NativeResult<AdapterState> {
        let state = self.enter("adapter_state", String::new())?;
        Ok(if state.adapter_enabled {
            AdapterState::Enabled
        } else {
            AdapterState::Disabled
        })
    }

    fn start_scan(&self, filter: &ScanFilter, on_result: ScanResultCallback) -> NativeResult<()> {
        let mut state = self.enter("start_scan", format!("{:?}", filter))?;
        state.scan_filter = Some(filter.clone());
        state.scan_cb = Some(on_result);
        Ok(())
    }

    fn stop_scan(&self) -> NativeResult<()> {
        let mut state = self.enter("stop_scan", String::new())?;
        state.scan_cb = None;
        state.scan_filter = None;
        Ok(())
    }

    fn set_connection_state_changed_cb(&self, callback: ConnectionStateCallback) -> NativeResult<()> {
        let mut state = self.enter("set_connection_state_changed_cb", String::new())?;
        state.connection_cb = Some(callback);
        Ok(())
    }

    fn unset_connection_state_changed_cb(&self) -> NativeResult<()> {
        let mut state = self.enter("unset_connection_state_changed_cb", String::new())?;
        state.connection_cb = None;
        Ok(())
    }

    fn connect(&self, address: &str, auto_connect: bool) -> NativeResult<()> {
        self.enter("connect", format!("{} auto_connect={}", address, auto_connect))?;
        Ok(())
    }

    fn disconnect(&self, address: &str) -> NativeResult<()> {
        self.enter("disconnect", address.to_string())?;
        Ok(())
    }

    fn create_client(&self, address: &str) -> NativeResult<ClientHandle> {
        let mut state = self.enter("create_client", address.to_string())?;
        let client = ClientHandle(state.next_id());
        state.clients.insert(client, address.to_string());
        Ok(client)
    }

    fn destroy_client(&self, client: ClientHandle) -> NativeResult<()> {
        let mut state = self.enter("destroy_client", format!("{:?}", client))?;
        state
            .clients
            .remove(&client)
            .map(|_| ())
            .ok_or(NativeStatus::INVALID_PARAMETER)
    }

    fn foreach_services(&self, client: ClientHandle, visitor: HandleVisitor<'_>) -> NativeResult<()> {
        let handles = {
            let state = self.enter("foreach_services", format!("{:?}", client))?;
            let address = state
                .clients
                .get(&client)
                .ok_or(NativeStatus::INVALID_PARAMETER)?;
            state.profiles.get(address).cloned().unwrap_or_default()
        };
        Self::enumerate(handles, visitor)
    }

    fn foreach_included_services(
        &self,
        service: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        let handles = {
            let mut state = self.enter("foreach_included_services", format!("{:?}", service))?;
            state.attribute(service)?.included.clone()
        };
        Self::enumerate(handles, visitor)
    }

    fn foreach_characteristics(
        &self,
        service: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        let handles = {
            let mut state = self.enter("foreach_characteristics", format!("{:?}", service))?;
            state.attribute(service)?.children.clone()
        };
        Self::enumerate(handles, visitor)
    }

    fn foreach_descriptors(
        &self,
        characteristic: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()> {
        let handles = {
            let mut state = self.enter("foreach_descriptors", format!("{:?}", characteristic))?;
            state.attribute(characteristic)?.children.clone()
        };
        Self::enumerate(handles, visitor)
    }

    fn uuid(&self, handle: GattHandle) -> NativeResult<Uuid> {
        let mut state = self.enter("uuid", format!("{:?}", handle))?;
        Ok(state.attribute(handle)?.uuid)
    }

    fn value(&self, handle: GattHandle) -> NativeResult<Vec<u8>> {
        let mut state = self.enter("value", format!("{:?}", handle))?;
        Ok(state.attribute(handle)?.value.clone())
    }

    fn set_value(&self, handle: GattHandle, value: &[u8]) -> NativeResult<()> {
        let mut state = self.enter("set_value", format!("{:?}", handle))?;
        state.attribute(handle)?.value = value.to_vec();
        Ok(())
    }

    fn properties(&self, characteristic: GattHandle) -> NativeResult<u32> {
        let mut state = self.enter("properties", format!("{:?}", characteristic))?;
        Ok(state.attribute(characteristic)?.properties)
    }

    fn set_write_type(&self, characteristic: GattHandle, write_type: WriteType) -> NativeResult<()> {
        let mut state = self.enter("set_write_type", format!("{:?}", write_type))?;
        state.attribute(characteristic)?.write_type = write_type;
        Ok(())
    }

    fn read_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()> {
        let mut state = self.enter("read_value", format!("{:?}", handle))?;
        state.attribute(handle)?;
        state.pending_reads.push((handle, on_complete));
        Ok(())
    }

    fn write_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()> {
        let mut state = self.enter("write_value", format!("{:?}", handle))?;
        state.attribute(handle)?;
        state.pending_writes.push((handle, on_complete));
        Ok(())
    }

    fn set_value_changed_cb(
        &self,
        characteristic: GattHandle,
        callback: ValueChangedCallback,
    ) -> NativeResult<()> {
        let mut state = self.enter("set_value_changed_cb", format!("{:?}", characteristic))?;
        state.attribute(characteristic)?;
        state.value_changed.insert(characteristic, Arc::from(callback));
        Ok(())
    }

    fn unset_value_changed_cb(&self, characteristic: GattHandle) -> NativeResult<()> {
        let mut state = self.enter("unset_value_changed_cb", format!("{:?}", characteristic))?;
        state.value_changed.remove(&characteristic);
        Ok(())
    }

    fn att_mtu(&self, client: ClientHandle) -> NativeResult<u32> {
        let state = self.enter("att_mtu", format!("{:?}", client))?;
        if !state.clients.contains_key(&client) {
            return Err(NativeStatus::INVALID_PARAMETER);
        }
        Ok(state.mtu.get(&client).copied().unwrap_or(DEFAULT_MTU))
    }

    fn set_att_mtu_changed_cb(&self, client: ClientHandle, callback: MtuChangedCallback) -> NativeResult<()> {
        let mut state = self.enter("set_att_mtu_changed_cb", format!("{:?}", client))?;
        state.mtu_callbacks.push((client, callback));
        Ok(())
    }

    fn unset_att_mtu_changed_cb(&self, client: ClientHandle) -> NativeResult<()> {
        let removed = {
            let mut state = self.enter("unset_att_mtu_changed_cb", format!("{:?}", client))?;
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.mtu_callbacks)
                .into_iter()
                .partition(|(owner, _)| *owner == client);
            state.mtu_callbacks = kept;
            removed
        };
        drop(removed);
        Ok(())
    }

    fn request_att_mtu_change(&self, client: ClientHandle, mtu: u32) -> NativeResult<()> {
        let mut state = self.enter("request_att_mtu_change", mtu.to_string())?;
        state.requested_mtu.insert(client, mtu);
        Ok(())
    }
}
