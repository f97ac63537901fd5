//! Native Bluetooth stack boundary.
//!
//! The core never talks to a Bluetooth controller directly. Everything goes
//! through [`NativeStack`], a handle-based API whose asynchronous requests
//! complete through callbacks fired on threads owned by the stack.
//!
//! Request callbacks are `FnOnce`: a stack delivers each one at most once and
//! drops it afterwards, so whatever the callback captured is released exactly
//! once whether or not it ever ran.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque reference to a service, characteristic or descriptor.
///
/// Only valid while the connection that produced it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GattHandle(pub u64);

/// Opaque reference to a per-address GATT client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientHandle(pub u64);

/// Result code reported by the native stack.
///
/// Zero is success, everything else is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NativeStatus(pub i32);

impl NativeStatus {
    /// Success.
    pub const OK: Self = Self(0);
    /// Generic failure.
    pub const OPERATION_FAILED: Self = Self(-1);
    /// An argument was rejected.
    pub const INVALID_PARAMETER: Self = Self(-2);
    /// The stack does not implement this operation.
    pub const NOT_SUPPORTED: Self = Self(-3);
    /// The remote device is not connected.
    pub const NOT_CONNECTED: Self = Self(-4);
    /// The referenced device or attribute does not exist.
    pub const NOT_FOUND: Self = Self(-5);
    /// The caller lacks Bluetooth permission.
    pub const PERMISSION_DENIED: Self = Self(-6);
    /// The request timed out inside the stack.
    pub const TIMED_OUT: Self = Self(-7);
    /// The adapter is switched off.
    pub const NOT_ENABLED: Self = Self(-8);

    /// Whether this status means success.
    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// Convert into a `Result`, naming the failed operation.
    pub fn check(self, operation: &'static str) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::native(operation, self))
        }
    }

    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::OK => "ok",
            Self::OPERATION_FAILED => "operation failed",
            Self::INVALID_PARAMETER => "invalid parameter",
            Self::NOT_SUPPORTED => "not supported",
            Self::NOT_CONNECTED => "not connected",
            Self::NOT_FOUND => "not found",
            Self::PERMISSION_DENIED => "permission denied",
            Self::TIMED_OUT => "timed out",
            Self::NOT_ENABLED => "not enabled",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// Result of a synchronous native call.
pub type NativeResult<T> = std::result::Result<T, NativeStatus>;

/// Logging conversion from native results into crate errors.
pub(crate) trait NativeResultExt<T> {
    /// Log a failure under `operation` and convert it into [`Error::Native`].
    fn logged(self, operation: &'static str) -> Result<T>;
}

impl<T> NativeResultExt<T> for NativeResult<T> {
    fn logged(self, operation: &'static str) -> Result<T> {
        self.map_err(|status| {
            warn!("{} failed: {}", operation, status);
            Error::native(operation, status)
        })
    }
}

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// Adapter present but switched off.
    Disabled,
    /// Adapter present and on.
    Enabled,
}

/// Write mode applied to a characteristic before a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteType {
    /// Acknowledged write.
    #[default]
    WithResponse,
    /// Write command, no acknowledgement.
    WithoutResponse,
}

/// Filter passed to the native scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report these addresses. Empty means all.
    pub device_ids: Vec<String>,
    /// Only report devices advertising one of these services. Empty means all.
    pub service_uuids: Vec<Uuid>,
    /// Report every advertisement instead of the first per device.
    pub allow_duplicates: bool,
}

/// Advertisement payload as already decoded by the native stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Complete or shortened local name.
    pub local_name: Option<String>,
    /// Manufacturer specific data by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
    /// Whether the advertiser accepts connections.
    pub connectable: bool,
}

/// One scan report.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanResult {
    /// Device address.
    pub address: String,
    /// Device name, if known.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Decoded advertisement.
    pub advertisement: AdvertisementData,
}

/// Completion of a read or write request.
pub type RequestCallback = Box<dyn FnOnce(NativeStatus) + Send>;

/// Completion of an MTU change request: status and the negotiated MTU.
pub type MtuChangedCallback = Box<dyn FnOnce(NativeStatus, u32) + Send>;

/// Fired for every notification or indication with the new value.
pub type ValueChangedCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Fired with `(status, connected, address)` whenever a GATT link changes.
pub type ConnectionStateCallback = Arc<dyn Fn(NativeStatus, bool, &str) + Send + Sync>;

/// Fired for every scan report.
pub type ScanResultCallback = Arc<dyn Fn(NativeStatus, ScanResult) + Send + Sync>;

/// Visitor for synchronous enumeration: `(total, index, handle)`, return
/// `true` to continue.
pub type HandleVisitor<'a> = &'a mut dyn FnMut(usize, usize, GattHandle) -> bool;

/// The native Bluetooth stack.
///
/// Enumeration calls are synchronous and invoke the visitor before returning.
/// Request calls return as soon as the request is queued; their callback
/// fires later on a stack-owned thread.
pub trait NativeStack: Send + Sync {
    /// Power state of the adapter.
    fn adapter_state(&self) -> NativeResult<AdapterState>;

    /// Start an LE scan.
    fn start_scan(&self, filter: &ScanFilter, on_result: ScanResultCallback) -> NativeResult<()>;

    /// Stop the running LE scan.
    fn stop_scan(&self) -> NativeResult<()>;

    /// Install the process-wide connection state callback.
    fn set_connection_state_changed_cb(&self, callback: ConnectionStateCallback)
        -> NativeResult<()>;

    /// Remove the connection state callback.
    fn unset_connection_state_changed_cb(&self) -> NativeResult<()>;

    /// Request a GATT connection.
    fn connect(&self, address: &str, auto_connect: bool) -> NativeResult<()>;

    /// Request a GATT disconnection.
    fn disconnect(&self, address: &str) -> NativeResult<()>;

    /// Create the GATT client for a connected address.
    fn create_client(&self, address: &str) -> NativeResult<ClientHandle>;

    /// Destroy a GATT client.
    fn destroy_client(&self, client: ClientHandle) -> NativeResult<()>;

    /// Enumerate primary services of a client.
    fn foreach_services(&self, client: ClientHandle, visitor: HandleVisitor<'_>)
        -> NativeResult<()>;

    /// Enumerate included services of a service.
    fn foreach_included_services(
        &self,
        service: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()>;

    /// Enumerate characteristics of a service.
    fn foreach_characteristics(
        &self,
        service: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()>;

    /// Enumerate descriptors of a characteristic.
    fn foreach_descriptors(
        &self,
        characteristic: GattHandle,
        visitor: HandleVisitor<'_>,
    ) -> NativeResult<()>;

    /// UUID of any attribute.
    fn uuid(&self, handle: GattHandle) -> NativeResult<Uuid>;

    /// Locally held value of a characteristic or descriptor.
    fn value(&self, handle: GattHandle) -> NativeResult<Vec<u8>>;

    /// Stage a value to be sent by the next write request.
    fn set_value(&self, handle: GattHandle, value: &[u8]) -> NativeResult<()>;

    /// Characteristic property bitmask.
    fn properties(&self, characteristic: GattHandle) -> NativeResult<u32>;

    /// Set the write mode used by subsequent writes on this characteristic.
    fn set_write_type(&self, characteristic: GattHandle, write_type: WriteType)
        -> NativeResult<()>;

    /// Read the remote value.
    fn read_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()>;

    /// Write the staged value to the remote.
    fn write_value(&self, handle: GattHandle, on_complete: RequestCallback) -> NativeResult<()>;

    /// Subscribe to notifications/indications.
    fn set_value_changed_cb(
        &self,
        characteristic: GattHandle,
        callback: ValueChangedCallback,
    ) -> NativeResult<()>;

    /// Unsubscribe from notifications/indications.
    fn unset_value_changed_cb(&self, characteristic: GattHandle) -> NativeResult<()>;

    /// Current ATT MTU of a client.
    fn att_mtu(&self, client: ClientHandle) -> NativeResult<u32>;

    /// Install the callback for the next MTU change on this client.
    fn set_att_mtu_changed_cb(&self, client: ClientHandle, callback: MtuChangedCallback)
        -> NativeResult<()>;

    /// Remove the MTU change callback of this client.
    fn unset_att_mtu_changed_cb(&self, client: ClientHandle) -> NativeResult<()>;

    /// Ask the remote for a new MTU.
    fn request_att_mtu_change(&self, client: ClientHandle, mtu: u32) -> NativeResult<()>;
}

/// Drain a `foreach` style enumeration into an ordered list of handles.
///
/// Handles keep native delivery order. A failing enumeration yields its
/// status and discards anything delivered before the failure.
pub fn collect_handles<F>(enumerate: F) -> NativeResult<Vec<GattHandle>>
where
    F: FnOnce(HandleVisitor<'_>) -> NativeResult<()>,
{
    let mut handles = Vec::new();
    enumerate(&mut |_total, _index, handle| {
        handles.push(handle);
        true
    })?;
    Ok(handles)
}
