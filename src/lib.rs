// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-gatt-bridge
//!
//! A client-side Bluetooth Low Energy GATT object model layered over a
//! handle-based, callback-driven native Bluetooth stack.
//!
//! The native stack hands out opaque handles and completes requests on its
//! own threads, possibly after the object that issued a request is gone.
//! This crate keeps that safe: every pending callback resolves its target
//! through a registry and is silently discarded if the target was dropped.
//!
//! ## Features
//!
//! - **Scanning**: One shared scan session with address, service and
//!   duplicate filters
//! - **Connection state machine**: Disconnected, Connecting, Connected and
//!   Disconnecting per device, driven by native callbacks
//! - **Service discovery**: Primary services, included services,
//!   characteristics and descriptors rebuilt on every pass
//! - **Reads, writes and notifications**: Cached values refreshed from the
//!   stack, results published as events
//! - **MTU and RSSI**: MTU negotiation and RSSI reads through a filtered scan
//! - **Pluggable backend**: Any [`NativeStack`], with a btleplug backend built in
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_gatt_bridge::{DeviceManager, GattEvent, ManagerConfig, Result, ScanSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::with_btleplug(ManagerConfig::default()).await?;
//!     let mut events = manager.subscribe();
//!     manager.start_scan(ScanSettings::new())?;
//!
//!     // Connect to the first device that shows up
//!     while let Ok(event) = events.recv().await {
//!         if let GattEvent::ScanResult(result) = event {
//!             manager.stop_scan()?;
//!             manager.connect(&result.address, false)?;
//!             break;
//!         }
//!     }
//!
//!     manager.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. CoreBluetooth hides device addresses,
//! so the btleplug backend reports them as zero.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for snapshots and events

// Public modules
pub mod ble;
pub mod config;
pub mod device;
pub mod device_manager;
pub mod error;
pub mod gatt;
pub mod notifications;
pub mod registry;
pub mod utils;

pub(crate) mod context;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device::DeviceController;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use notifications::{CallbackHandle, GattEvent};
pub use utils::normalize_address;

// Re-export commonly used types from submodules
pub use ble::{
    AdapterState, BtleplugStack, ConnectionState, NativeStack, NativeStatus, ScanResult,
    ScanSettings,
};
pub use gatt::{
    Characteristic, CharacteristicPath, CharacteristicProperties, CharacteristicSnapshot,
    Descriptor, DescriptorPath, DescriptorSnapshot, DeviceSnapshot, Service, ServiceKind,
    ServicePath, ServiceSnapshot,
};
