//! Observer fan-out
//!
//! Observers hear about completed operations and unexpected failures.
//! Each callback receives a [`CoordinatorSnapshot`] taken at the time of
//! the notification, since the coordinator itself is mutably borrowed
//! while it dispatches.

use heapless::Vec;

use crate::error::Error;
use crate::state::ControllerState;

/// Coordinator state passed to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoordinatorSnapshot {
    /// Controller state
    pub state: ControllerState,
    /// Registered persisters
    pub registered: usize,
    /// Persisters whose record holds their last saved state
    pub saved: usize,
    /// Persisters with a save or delete pending or in flight
    pub pending: usize,
}

/// Receiver of coordinator notifications
///
/// Every method defaults to doing nothing. Callbacks run inside the
/// coordinator call that caused them and must not call back into it.
pub trait FlashObserver {
    /// Flash storage is initialized and the coordinator is idle
    fn on_flash_initialized(&self, _snapshot: &CoordinatorSnapshot) {}

    /// Every registered persister's record holds its last saved state
    fn on_data_saved(&self, _snapshot: &CoordinatorSnapshot) {}

    /// A restore of all persisters finished without failure
    fn on_data_restored(&self, _snapshot: &CoordinatorSnapshot) {}

    /// A requested clear finished
    fn on_data_cleared(&self, _snapshot: &CoordinatorSnapshot) {}

    /// An operation failed in a way the coordinator cannot recover from
    fn on_flash_error(&self, _snapshot: &CoordinatorSnapshot, _error: Error) {}
}

/// Bounded list of up to `O` observers
pub struct ObserverList<'a, const O: usize> {
    observers: Vec<&'a dyn FlashObserver, O>,
}

impl<'a, const O: usize> ObserverList<'a, O> {
    pub const fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Add an observer; adding the same observer twice has no effect
    pub fn add(&mut self, observer: &'a dyn FlashObserver) -> Result<(), Error> {
        if self
            .observers
            .iter()
            .any(|o| core::ptr::addr_eq(*o, observer))
        {
            return Ok(());
        }
        self.observers
            .push(observer)
            .map_err(|_| Error::ObserversFull)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn initialized(&self, snapshot: &CoordinatorSnapshot) {
        for observer in &self.observers {
            observer.on_flash_initialized(snapshot);
        }
    }

    pub fn saved(&self, snapshot: &CoordinatorSnapshot) {
        for observer in &self.observers {
            observer.on_data_saved(snapshot);
        }
    }

    pub fn restored(&self, snapshot: &CoordinatorSnapshot) {
        for observer in &self.observers {
            observer.on_data_restored(snapshot);
        }
    }

    pub fn cleared(&self, snapshot: &CoordinatorSnapshot) {
        for observer in &self.observers {
            observer.on_data_cleared(snapshot);
        }
    }

    pub fn error(&self, snapshot: &CoordinatorSnapshot, error: Error) {
        for observer in &self.observers {
            observer.on_flash_error(snapshot, error);
        }
    }
}

impl<const O: usize> Default for ObserverList<'_, O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    #[derive(Default)]
    struct Counter {
        saved: Cell<u32>,
        errors: Cell<u32>,
    }

    impl FlashObserver for Counter {
        fn on_data_saved(&self, _snapshot: &CoordinatorSnapshot) {
            self.saved.set(self.saved.get() + 1);
        }

        fn on_flash_error(&self, _snapshot: &CoordinatorSnapshot, _error: Error) {
            self.errors.set(self.errors.get() + 1);
        }
    }

    const SNAPSHOT: CoordinatorSnapshot = CoordinatorSnapshot {
        state: ControllerState::Idle,
        registered: 0,
        saved: 0,
        pending: 0,
    };

    #[test]
    fn test_fan_out() {
        let a = Counter::default();
        let b = Counter::default();
        let mut list: ObserverList<'_, 2> = ObserverList::new();
        list.add(&a).unwrap();
        list.add(&b).unwrap();

        list.saved(&SNAPSHOT);
        list.error(&SNAPSHOT, Error::FlashExhausted);
        // Callbacks an observer does not override are no-ops
        list.cleared(&SNAPSHOT);

        assert_eq!(a.saved.get(), 1);
        assert_eq!(b.saved.get(), 1);
        assert_eq!(a.errors.get(), 1);
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let a = Counter::default();
        let b = Counter::default();
        let mut list: ObserverList<'_, 1> = ObserverList::new();
        list.add(&a).unwrap();
        list.add(&a).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.add(&b), Err(Error::ObserversFull));
    }
}
