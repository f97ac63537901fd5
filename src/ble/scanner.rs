//! BLE scanning.
//!
//! One scan session runs at a time. Starting a new session replaces the
//! running one, which is how an RSSI read borrows the scanner.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::native::{NativeResultExt, NativeStack, ScanFilter, ScanResult, ScanResultCallback};
use crate::error::Result;
use crate::utils::same_address;

/// Scan parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSettings {
    /// Only report these addresses. Empty means all.
    pub device_ids: Vec<String>,
    /// Only report devices advertising one of these services. Empty means all.
    pub service_uuids: Vec<Uuid>,
    /// Report every advertisement instead of the first per device.
    pub allow_duplicates: bool,
}

impl ScanSettings {
    /// Unfiltered scan without duplicates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan for a single address, reporting every advertisement.
    pub fn for_device(address: impl Into<String>) -> Self {
        Self {
            device_ids: vec![address.into()],
            service_uuids: Vec::new(),
            allow_duplicates: true,
        }
    }

    /// Add a service UUID filter.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    /// Report duplicates or not.
    pub fn with_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    fn filter(&self) -> ScanFilter {
        ScanFilter {
            device_ids: self.device_ids.clone(),
            service_uuids: self.service_uuids.clone(),
            allow_duplicates: self.allow_duplicates,
        }
    }

    /// Whether a report passes the address and service filters.
    pub fn matches(&self, result: &ScanResult) -> bool {
        let address_ok = self.device_ids.is_empty()
            || self
                .device_ids
                .iter()
                .any(|id| same_address(id, &result.address));

        let service_ok = self.service_uuids.is_empty()
            || result
                .advertisement
                .service_uuids
                .iter()
                .any(|uuid| self.service_uuids.contains(uuid));

        address_ok && service_ok
    }
}

/// Receives the session id and each scan report that passed its filters.
pub(crate) type ScanHandler = Arc<dyn Fn(u64, &ScanResult) + Send + Sync>;

struct ScanSession {
    id: u64,
    settings: ScanSettings,
    seen: HashSet<String>,
    handler: ScanHandler,
}

impl ScanSession {
    fn accept(&mut self, result: &ScanResult) -> bool {
        if !self.settings.matches(result) {
            return false;
        }
        // Stacks that ignore the duplicate filter still get deduplicated here.
        self.settings.allow_duplicates || self.seen.insert(result.address.to_ascii_uppercase())
    }
}

/// Scan session owner.
pub(crate) struct Scanner {
    stack: Arc<dyn NativeStack>,
    session: Arc<Mutex<Option<ScanSession>>>,
    next_id: AtomicU64,
}

impl Scanner {
    pub(crate) fn new(stack: Arc<dyn NativeStack>) -> Self {
        Self {
            stack,
            session: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a session, replacing any running one. Returns the session id.
    pub(crate) fn start(&self, settings: ScanSettings, handler: ScanHandler) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if self.session.lock().take().is_some() {
            debug!("Replacing running scan session");
            if let Err(status) = self.stack.stop_scan() {
                warn!("stop scan failed: {}", status);
            }
        }

        let filter = settings.filter();
        *self.session.lock() = Some(ScanSession {
            id,
            settings,
            seen: HashSet::new(),
            handler,
        });

        let session = Arc::downgrade(&self.session);
        let on_result: ScanResultCallback = Arc::new(move |status, result| {
            if !status.is_ok() {
                warn!("scan result callback reported {}", status);
                return;
            }
            let Some(session) = session.upgrade() else {
                return;
            };

            let handler = {
                let mut guard = session.lock();
                match guard.as_mut() {
                    Some(current) if current.id == id => current
                        .accept(&result)
                        .then(|| current.handler.clone()),
                    _ => None,
                }
            };

            match handler {
                Some(handler) => handler(id, &result),
                None => trace!("Scan result for {} filtered", result.address),
            }
        });

        if let Err(err) = self.stack.start_scan(&filter, on_result).logged("start scan") {
            self.clear(id);
            return Err(err);
        }

        info!("Scan session {} started", id);
        Ok(id)
    }

    /// Stop whichever session is running.
    pub(crate) fn stop(&self) -> Result<()> {
        if self.session.lock().take().is_none() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping scan");
        self.stack.stop_scan().logged("stop scan")
    }

    /// Stop the session `id` if it is still the running one.
    pub(crate) fn stop_session(&self, id: u64) -> Result<()> {
        let running = {
            let mut guard = self.session.lock();
            if guard.as_ref().map(|s| s.id) == Some(id) {
                guard.take();
                true
            } else {
                false
            }
        };

        if running {
            debug!("Stopping scan session {}", id);
            self.stack.stop_scan().logged("stop scan")?;
        }
        Ok(())
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.session.lock().is_some()
    }

    fn clear(&self, id: u64) {
        let mut guard = self.session.lock();
        if guard.as_ref().map(|s| s.id) == Some(id) {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::native::{AdvertisementData, NativeStatus};
    use crate::testing::FakeStack;
    use std::sync::atomic::AtomicUsize;

    fn result(address: &str, services: Vec<Uuid>) -> ScanResult {
        ScanResult {
            address: address.to_string(),
            name: None,
            rssi: -60,
            advertisement: AdvertisementData {
                service_uuids: services,
                ..Default::default()
            },
        }
    }

    fn counting_handler() -> (ScanHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = count.clone();
        let handler: ScanHandler = Arc::new(move |_, _| {
            handler_count.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn test_settings_match_address_case_insensitive() {
        let settings = ScanSettings::for_device("aa:bb:cc:dd:ee:ff");
        assert!(settings.matches(&result("AA:BB:CC:DD:EE:FF", vec![])));
        assert!(!settings.matches(&result("AA:BB:CC:DD:EE:00", vec![])));
    }

    #[test]
    fn test_settings_match_service() {
        let wanted = Uuid::from_u128(1);
        let settings = ScanSettings::new().with_service(wanted);
        assert!(settings.matches(&result("A", vec![Uuid::from_u128(2), wanted])));
        assert!(!settings.matches(&result("A", vec![Uuid::from_u128(2)])));
    }

    #[test]
    fn test_duplicates_suppressed() {
        let stack = Arc::new(FakeStack::new());
        let scanner = Scanner::new(stack.clone());
        let (handler, count) = counting_handler();

        scanner.start(ScanSettings::new(), handler).unwrap();
        stack.emit_scan_result(NativeStatus::OK, result("AA", vec![]));
        stack.emit_scan_result(NativeStatus::OK, result("AA", vec![]));
        stack.emit_scan_result(NativeStatus::OK, result("BB", vec![]));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicates_allowed() {
        let stack = Arc::new(FakeStack::new());
        let scanner = Scanner::new(stack.clone());
        let (handler, count) = counting_handler();

        scanner
            .start(ScanSettings::new().with_duplicates(true), handler)
            .unwrap();
        stack.emit_scan_result(NativeStatus::OK, result("AA", vec![]));
        stack.emit_scan_result(NativeStatus::OK, result("AA", vec![]));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_result_ignored() {
        let stack = Arc::new(FakeStack::new());
        let scanner = Scanner::new(stack.clone());
        let (handler, count) = counting_handler();

        scanner.start(ScanSettings::new(), handler).unwrap();
        stack.emit_scan_result(NativeStatus::OPERATION_FAILED, result("AA", vec![]));

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_and_restart() {
        let stack = Arc::new(FakeStack::new());
        let scanner = Scanner::new(stack.clone());
        let (handler, _) = counting_handler();

        assert!(!scanner.is_scanning());
        let first = scanner.start(ScanSettings::new(), handler.clone()).unwrap();
        assert!(scanner.is_scanning());

        let second = scanner.start(ScanSettings::new(), handler).unwrap();
        assert_ne!(first, second);

        // The replaced session can no longer stop the new one.
        scanner.stop_session(first).unwrap();
        assert!(scanner.is_scanning());

        scanner.stop().unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(stack.calls_named("stop_scan"), 2);
    }

    #[test]
    fn test_start_failure_clears_session() {
        let stack = Arc::new(FakeStack::new());
        stack.fail("start_scan", NativeStatus::NOT_ENABLED);
        let scanner = Scanner::new(stack.clone());
        let (handler, _) = counting_handler();

        let err = scanner.start(ScanSettings::new(), handler).unwrap_err();
        assert_eq!(err.native_status(), Some(NativeStatus::NOT_ENABLED));
        assert!(!scanner.is_scanning());
    }
}
