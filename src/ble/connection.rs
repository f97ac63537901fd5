//! Connection state for a GATT link.
//!
//! `Connecting` and `Disconnecting` only exist while a native request is
//! outstanding; the native connection-state callback is the only thing that
//! leaves them.

use std::sync::atomic::{AtomicBool, Ordering};

/// Connection state for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the device.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the device.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Lock-free connection flags of one device.
///
/// The pending flags take precedence over the link flag when deriving the
/// observable [`ConnectionState`].
#[derive(Debug, Default)]
pub(crate) struct ConnectionFlags {
    connected: AtomicBool,
    connecting: AtomicBool,
    disconnecting: AtomicBool,
}

impl ConnectionFlags {
    pub(crate) fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            ConnectionState::Connecting
        } else if self.disconnecting.load(Ordering::SeqCst) {
            ConnectionState::Disconnecting
        } else if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub(crate) fn set_connecting(&self, value: bool) {
        self.connecting.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_disconnecting(&self, value: bool) {
        self.disconnecting.store(value, Ordering::SeqCst);
    }

    /// Mark the link as gone while teardown is still running. Observers see
    /// `Disconnecting` until [`settle`](Self::settle).
    pub(crate) fn begin_teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);
        self.disconnecting.store(true, Ordering::SeqCst);
    }

    /// Record the link outcome reported by the stack and drop both pending
    /// flags.
    pub(crate) fn settle(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);
        self.disconnecting.store(false, Ordering::SeqCst);
    }
}
