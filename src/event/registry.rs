use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{GpioError, Result};

use super::watcher::Watcher;

#[derive(Default)]
struct Slots {
    watchers: FxHashMap<u32, Arc<Watcher>>,
    waiting: FxHashSet<u32>,
}

impl Slots {
    fn is_taken(&self, pin: u32) -> bool {
        self.watchers.contains_key(&pin) || self.waiting.contains(&pin)
    }
}

/// Pin → watcher table. Pins with a blocking wait in progress are reserved
/// here too so the two modes exclude each other.
#[derive(Default)]
pub(crate) struct Registry {
    slots: Mutex<Slots>,
    generation: AtomicU32,
}

impl Registry {
    /// Multiplexer key for a new watcher on `pin`, unique across re-registrations.
    pub(crate) fn next_token(&self, pin: u32) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        (u64::from(generation) << 32) | u64::from(pin)
    }

    pub(crate) fn insert(&self, watcher: Arc<Watcher>) -> Result<()> {
        let mut slots = self.slots.lock();
        let pin = watcher.pin();
        if slots.is_taken(pin) {
            return Err(GpioError::AlreadyRegistered(pin));
        }
        slots.watchers.insert(pin, watcher);
        Ok(())
    }

    pub(crate) fn get(&self, pin: u32) -> Option<Arc<Watcher>> {
        self.slots.lock().watchers.get(&pin).cloned()
    }

    /// Watcher owning a multiplexer token, if it is still registered.
    pub(crate) fn by_token(&self, token: u64) -> Option<Arc<Watcher>> {
        let pin = (token & u64::from(u32::MAX)) as u32;
        self.get(pin).filter(|w| w.token() == token)
    }

    pub(crate) fn contains(&self, pin: u32) -> bool {
        self.slots.lock().is_taken(pin)
    }

    pub(crate) fn remove(&self, pin: u32) -> Option<Arc<Watcher>> {
        self.slots.lock().watchers.remove(&pin)
    }

    /// Whether `watcher` is the one currently registered for its pin.
    pub(crate) fn holds(&self, watcher: &Watcher) -> bool {
        self.by_token(watcher.token()).is_some()
    }

    /// Removes `watcher` only if it still owns its pin.
    pub(crate) fn remove_watcher(&self, watcher: &Watcher) -> bool {
        let mut slots = self.slots.lock();
        let owned = slots
            .watchers
            .get(&watcher.pin())
            .is_some_and(|current| current.token() == watcher.token());
        if owned {
            slots.watchers.remove(&watcher.pin());
        }
        owned
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Watcher>> {
        self.slots
            .lock()
            .watchers
            .drain()
            .map(|(_, watcher)| watcher)
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Watcher>> {
        self.slots.lock().watchers.values().cloned().collect()
    }

    pub(crate) fn pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.slots.lock().watchers.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub(crate) fn reserve(&self, pin: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.is_taken(pin) {
            return Err(GpioError::AlreadyRegistered(pin));
        }
        slots.waiting.insert(pin);
        Ok(())
    }

    pub(crate) fn release(&self, pin: u32) {
        self.slots.lock().waiting.remove(&pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Edge;

    fn watcher(registry: &Registry, pin: u32) -> Arc<Watcher> {
        Arc::new(Watcher::new(
            pin,
            Edge::Both,
            registry.next_token(pin),
            None,
        ))
    }

    #[test]
    fn one_watcher_per_pin() {
        let registry = Registry::default();
        let first = watcher(&registry, 8);
        registry.insert(first.clone()).expect("first");

        let err = registry.insert(watcher(&registry, 8)).unwrap_err();
        assert!(matches!(err, GpioError::AlreadyRegistered(8)));
        assert_eq!(registry.get(8).map(|w| w.token()), Some(first.token()));
    }

    #[test]
    fn stale_tokens_do_not_resolve() {
        let registry = Registry::default();
        let old = watcher(&registry, 3);
        registry.insert(old.clone()).expect("insert");
        registry.remove(3);
        let new = watcher(&registry, 3);
        registry.insert(new.clone()).expect("insert");

        assert!(registry.by_token(old.token()).is_none());
        assert!(registry.by_token(new.token()).is_some());
    }

    #[test]
    fn removal_by_watcher_spares_a_newer_registration() {
        let registry = Registry::default();
        let old = watcher(&registry, 5);
        registry.insert(old.clone()).expect("insert");
        assert!(registry.holds(&old));
        registry.remove(5);

        let new = watcher(&registry, 5);
        registry.insert(new.clone()).expect("insert");
        assert!(!registry.holds(&old));
        assert!(!registry.remove_watcher(&old));
        assert!(registry.holds(&new));
        assert!(registry.remove_watcher(&new));
        assert!(!registry.contains(5));
    }

    #[test]
    fn reservations_block_watchers() {
        let registry = Registry::default();
        registry.reserve(6).expect("reserve");
        assert!(registry.reserve(6).is_err());
        assert!(registry.insert(watcher(&registry, 6)).is_err());

        registry.release(6);
        registry.insert(watcher(&registry, 6)).expect("insert");
        assert!(registry.reserve(6).is_err());
    }
}
