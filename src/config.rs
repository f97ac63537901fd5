//! Manager configuration.

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Capacity of the event broadcast channel. Slow subscribers lag past it.
    pub event_capacity: usize,
    /// Stop the filtered scan started by an RSSI read once it has delivered
    /// its first matching result.
    pub stop_scan_after_rssi: bool,
}

impl ManagerConfig {
    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Keep or stop the RSSI scan after its first result.
    pub fn with_stop_scan_after_rssi(mut self, stop: bool) -> Self {
        self.stop_scan_after_rssi = stop;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            stop_scan_after_rssi: true,
        }
    }
}
