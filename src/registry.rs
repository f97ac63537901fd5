//! Handle registry and continuation dispatch.
//!
//! Native callbacks fire on stack threads, arbitrarily late, carrying only
//! whatever context they were given when the request was issued. Handing them
//! a reference to the entity would let a callback outlive its target, so every
//! callback-capable entity (devices and characteristics) registers a weak
//! backpointer here under a stable key, and requests carry only that key.
//!
//! When the callback fires it resolves the key. A missing entry, or an entry
//! whose target is already being dropped, means the entity is gone and the
//! callback does nothing.
//!
//! The table lock is held for the insert, erase or lookup itself and never
//! while user code runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

struct Entry<T> {
    token: u64,
    target: Weak<T>,
}

/// Key to weak-backpointer table for one entity kind.
pub struct HandleRegistry<K, T> {
    entries: Mutex<HashMap<K, Entry<T>>>,
    next_token: AtomicU64,
}

impl<K, T> HandleRegistry<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register `target` under `key`.
    ///
    /// The entry lives as long as the returned [`Registration`]; entities keep
    /// it as a field so the entry is erased when they are dropped. A second
    /// registration under the same key replaces the first.
    pub fn register(self: &Arc<Self>, key: K, target: Weak<T>) -> Registration<K, T> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .entries
            .lock()
            .insert(key.clone(), Entry { token, target });

        if previous.is_some() {
            warn!("Registry key {:?} registered twice, replacing", key);
        }

        Registration {
            registry: Arc::clone(self),
            key,
            token,
        }
    }

    /// Resolve a key to its live entity.
    pub fn lookup(&self, key: &K) -> Option<Arc<T>> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|entry| entry.target.upgrade())
    }

    /// Whether a key resolves to a live entity.
    pub fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn release(&self, key: &K, token: u64) {
        let mut entries = self.entries.lock();
        // A newer registration under the same key must survive.
        if entries.get(key).map(|entry| entry.token) == Some(token) {
            entries.remove(key);
            trace!("Registry key {:?} released", key);
        }
    }
}

impl<K, T> Default for HandleRegistry<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Registration guard. Dropping it erases the registry entry.
pub struct Registration<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    registry: Arc<HandleRegistry<K, T>>,
    key: K,
    token: u64,
}

impl<K, T> Registration<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    /// The registered key.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether this registration still owns its key, i.e. no later
    /// registration under the same key replaced it.
    pub fn is_current(&self) -> bool {
        self.registry.entries.lock().get(&self.key).map(|entry| entry.token) == Some(self.token)
    }
}

impl<K, T> Drop for Registration<K, T>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        self.registry.release(&self.key, self.token);
    }
}

/// A pending callback addressed by key rather than by reference.
///
/// Built when a request is issued and moved into the native completion
/// callback. Resolving consumes it, so the user callback is either handed
/// back together with its live target or dropped.
pub struct Continuation<K, F> {
    key: K,
    callback: F,
}

impl<K, F> Continuation<K, F>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Pair a key with the callback to run once the key resolves.
    pub fn new(key: K, callback: F) -> Self {
        Self { key, callback }
    }

    /// The key this continuation resolves.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Resolve against `registry`.
    ///
    /// Returns the live target and the callback, or `None` when the target no
    /// longer exists. The registry lock is released before this returns.
    pub fn resolve<T>(self, registry: &HandleRegistry<K, T>) -> Option<(Arc<T>, F)> {
        match registry.lookup(&self.key) {
            Some(target) => Some((target, self.callback)),
            None => {
                trace!("Callback target {:?} no longer exists, dropping", self.key);
                None
            }
        }
    }
}
