//! Shared context handed from the manager to every entity it creates.
//!
//! Holds the native stack, one registry per callback-capable entity kind, the
//! per-address GATT client table, the scanner and the event channel. Each
//! table is guarded by its own lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ble::native::{ClientHandle, NativeResultExt, NativeStack};
use crate::ble::scanner::Scanner;
use crate::config::ManagerConfig;
use crate::device::DeviceController;
use crate::error::Result;
use crate::gatt::{Characteristic, CharacteristicPath};
use crate::notifications::EventSender;
use crate::registry::HandleRegistry;

/// Registry of live devices by address.
pub type DeviceRegistry = HandleRegistry<String, DeviceController>;

/// Registry of live characteristics by path.
pub type CharacteristicRegistry = HandleRegistry<CharacteristicPath, Characteristic>;

/// Composition context shared by the manager, devices and GATT entities.
pub(crate) struct GattContext {
    pub(crate) stack: Arc<dyn NativeStack>,
    pub(crate) devices: Arc<DeviceRegistry>,
    pub(crate) characteristics: Arc<CharacteristicRegistry>,
    pub(crate) clients: ClientTable,
    pub(crate) scanner: Scanner,
    pub(crate) events: EventSender,
    pub(crate) config: ManagerConfig,
}

impl GattContext {
    pub(crate) fn new(stack: Arc<dyn NativeStack>, config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            devices: Arc::new(HandleRegistry::new()),
            characteristics: Arc::new(HandleRegistry::new()),
            clients: ClientTable::new(stack.clone()),
            scanner: Scanner::new(stack.clone()),
            events: EventSender::new(config.event_capacity),
            stack,
            config,
        })
    }
}

/// Per-address GATT client handles, created lazily and destroyed on
/// disconnect.
pub(crate) struct ClientTable {
    stack: Arc<dyn NativeStack>,
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl ClientTable {
    fn new(stack: Arc<dyn NativeStack>) -> Self {
        Self {
            stack,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `address`, created on first use.
    pub(crate) fn get_or_create(&self, address: &str) -> Result<ClientHandle> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(address) {
            return Ok(*client);
        }

        let client = self.stack.create_client(address).logged("create GATT client")?;
        debug!("Created GATT client {:?} for {}", client, address);
        clients.insert(address.to_string(), client);
        Ok(client)
    }

    /// Client for `address` if one exists.
    pub(crate) fn get(&self, address: &str) -> Option<ClientHandle> {
        self.clients.lock().get(address).copied()
    }

    /// Destroy the client for `address`, if any.
    ///
    /// The entry is kept when the stack refuses to destroy it.
    pub(crate) fn destroy_if_exists(&self, address: &str) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(address).copied() {
            match self.stack.destroy_client(client) {
                Ok(()) => {
                    clients.remove(address);
                    debug!("Destroyed GATT client {:?} for {}", client, address);
                }
                Err(status) => warn!("destroy GATT client for {} failed: {}", address, status),
            }
        }
    }
}
