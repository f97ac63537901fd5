//! BLE plumbing.
//!
//! The native stack boundary, the btleplug backend behind it, connection
//! state tracking and the shared scanner.

pub mod btleplug_stack;
pub mod connection;
pub mod native;
pub mod scanner;
pub mod uuids;

pub use btleplug_stack::BtleplugStack;
pub use connection::ConnectionState;
pub use native::{
    AdapterState, AdvertisementData, ClientHandle, GattHandle, NativeStack, NativeStatus,
    ScanFilter, ScanResult, WriteType,
};
pub use scanner::ScanSettings;
pub use uuids::*;
