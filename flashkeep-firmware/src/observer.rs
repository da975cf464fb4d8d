//! Observer forwarding coordinator notifications to a channel

use defmt::*;

use flashkeep_core::{CoordinatorSnapshot, Error, FlashObserver};

use crate::channels::{StorageEvent, STORAGE_EVENT};

/// Pushes every notification into [`STORAGE_EVENT`]
///
/// Notifications are dropped while the channel is full.
pub struct ChannelObserver;

impl ChannelObserver {
    fn forward(&self, event: StorageEvent) {
        if STORAGE_EVENT.try_send(event).is_err() {
            warn!("Storage event channel full, dropped {:?}", event);
        }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_flash_initialized(&self, snapshot: &CoordinatorSnapshot) {
        info!("Flash ready, {} persisters registered", snapshot.registered);
        self.forward(StorageEvent::Initialized);
    }

    fn on_data_saved(&self, snapshot: &CoordinatorSnapshot) {
        debug!("{} persisters saved", snapshot.saved);
        self.forward(StorageEvent::Saved);
    }

    fn on_data_restored(&self, _snapshot: &CoordinatorSnapshot) {
        self.forward(StorageEvent::Restored);
    }

    fn on_data_cleared(&self, _snapshot: &CoordinatorSnapshot) {
        self.forward(StorageEvent::Cleared);
    }

    fn on_flash_error(&self, snapshot: &CoordinatorSnapshot, error: Error) {
        error!("Storage error in {:?}: {:?}", snapshot.state, error);
        self.forward(StorageEvent::Failed(error));
    }
}
