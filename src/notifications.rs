//! Events published toward the message layer.
//!
//! Asynchronous results never surface as errors from the call that issued
//! them. They arrive here instead, success and failure alike, together with
//! the native status or success flag.

use tokio::sync::broadcast;
use tracing::trace;

use crate::ble::connection::ConnectionState;
use crate::ble::native::{NativeStatus, ScanResult};
use crate::gatt::{CharacteristicSnapshot, DescriptorSnapshot, ServiceSnapshot};

/// Something the message layer should hear about.
#[derive(Debug, Clone)]
pub enum GattEvent {
    /// A scan report that passed the session filters.
    ScanResult(ScanResult),
    /// A device's connection state changed.
    DeviceStateChanged {
        /// Device address.
        remote_id: String,
        /// New state.
        state: ConnectionState,
        /// Status reported by the stack.
        status: NativeStatus,
    },
    /// A discovery pass finished.
    ServicesDiscovered {
        /// Device address.
        remote_id: String,
        /// The rebuilt tree.
        services: Vec<ServiceSnapshot>,
    },
    /// An enumeration branch failed during discovery and was left empty.
    DiscoveryFailed {
        /// Device address.
        remote_id: String,
        /// Native operation that failed.
        operation: &'static str,
        /// Status it returned.
        status: NativeStatus,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        /// The characteristic after the read.
        characteristic: CharacteristicSnapshot,
        /// Status reported by the stack.
        status: NativeStatus,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        /// The characteristic after the write.
        characteristic: CharacteristicSnapshot,
        /// Whether the stack reported success.
        success: bool,
    },
    /// A descriptor read completed.
    DescriptorRead {
        /// The descriptor after the read.
        descriptor: DescriptorSnapshot,
        /// Status reported by the stack.
        status: NativeStatus,
    },
    /// A descriptor write completed.
    DescriptorWritten {
        /// The descriptor after the write.
        descriptor: DescriptorSnapshot,
        /// Whether the stack reported success.
        success: bool,
    },
    /// Notifications were switched on or off.
    NotificationStateChanged {
        /// The characteristic after the change.
        characteristic: CharacteristicSnapshot,
        /// Whether notifications are now on.
        enabled: bool,
    },
    /// A notification or indication arrived.
    CharacteristicChanged {
        /// The characteristic carrying the new value.
        characteristic: CharacteristicSnapshot,
    },
    /// An MTU change request completed.
    MtuChanged {
        /// Device address.
        remote_id: String,
        /// MTU after the request.
        mtu: u32,
        /// Whether the stack reported success.
        success: bool,
    },
    /// An RSSI read stopped the scan that was running.
    ScanPreempted {
        /// Address whose RSSI is being read.
        remote_id: String,
    },
    /// An RSSI read completed.
    RssiRead {
        /// Device address.
        remote_id: String,
        /// Signal strength in dBm.
        rssi: i16,
    },
}

/// Sending side of the event channel.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: broadcast::Sender<GattEvent>,
}

impl EventSender {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub(crate) fn send(&self, event: GattEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GattEvent> {
        self.tx.subscribe()
    }
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Spawn a task forwarding every event to `callback` until the handle drops.
///
/// Must be called from inside a tokio runtime.
pub(crate) fn spawn_event_callback<F>(
    id: u64,
    mut rx: broadcast::Receiver<GattEvent>,
    callback: F,
) -> CallbackHandle
where
    F: Fn(GattEvent) + Send + Sync + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => callback(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("Event callback {} lagged by {} events", id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle::new(id, move || {
        handle.abort();
    })
}
