//! Error types for the ble-gatt-bridge crate.

use thiserror::Error;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::native::NativeStatus;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the btleplug backend.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A synchronous native stack call returned a non-zero status.
    #[error("{operation} failed: {status}")]
    Native {
        /// Name of the native operation.
        operation: &'static str,
        /// The status code it returned.
        status: NativeStatus,
    },

    /// The device is not in a state that permits the operation.
    #[error("Invalid state for {operation}: device {address} is {state}")]
    InvalidState {
        /// The operation that was rejected.
        operation: &'static str,
        /// Address of the device.
        address: String,
        /// The state the device was in.
        state: ConnectionState,
    },

    /// The characteristic lacks a property bit the operation requires.
    #[error("Characteristic {uuid} does not support {required}")]
    MissingProperty {
        /// UUID of the characteristic.
        uuid: Uuid,
        /// Human readable description of the missing capability.
        required: &'static str,
    },

    /// No device with this address is known.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },

    /// Descriptor not found on the characteristic.
    #[error("Descriptor not found: {uuid}")]
    DescriptorNotFound {
        /// The UUID of the descriptor that was not found.
        uuid: Uuid,
    },

    /// The target of an awaited request was destroyed before its callback ran.
    #[error("Target released before completion: {target}")]
    Released {
        /// Identity of the released target.
        target: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a native-call failure.
    pub fn native(operation: &'static str, status: NativeStatus) -> Self {
        Self::Native { operation, status }
    }

    /// The native status carried by this error, if any.
    pub fn native_status(&self) -> Option<NativeStatus> {
        match self {
            Self::Native { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err = Error::InvalidState {
            operation: "connect",
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            state: ConnectionState::Connecting,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state for connect: device AA:BB:CC:DD:EE:FF is Connecting"
        );
    }

    #[test]
    fn test_native_status_accessor() {
        let err = Error::native("connect", NativeStatus::NOT_CONNECTED);
        assert_eq!(err.native_status(), Some(NativeStatus::NOT_CONNECTED));
        assert_eq!(Error::BluetoothUnavailable.native_status(), None);
    }
}
