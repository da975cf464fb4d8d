//! Inter-task communication channels
//!
//! Static embassy-sync channels between the storage task and the rest of
//! the firmware.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use flashkeep_core::Error;

/// Channel capacity for storage requests
const REQUEST_CHANNEL_SIZE: usize = 8;

/// Channel capacity for storage notifications
const EVENT_CHANNEL_SIZE: usize = 8;

/// Persisted state owned by the storage task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Slot {
    BootCount,
    Calibration,
}

/// Calibration values handed to the storage task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationUpdate {
    pub offset: i16,
    pub gain_x1000: u16,
}

/// Work for the storage task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageRequest {
    /// Replace calibration and save it
    SetCalibration(CalibrationUpdate),
    /// Save one slot as it is
    Save(Slot),
    /// Save every slot
    SaveAll,
    /// Erase every slot
    ClearAll,
    /// Kick the coordinator after backpressure
    Retry,
}

/// Coordinator notifications, forwarded from the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageEvent {
    Initialized,
    Saved,
    Restored,
    Cleared,
    Failed(Error),
}

/// Requests for the storage task
pub static STORAGE_REQUEST: Channel<CriticalSectionRawMutex, StorageRequest, REQUEST_CHANNEL_SIZE> =
    Channel::new();

/// Notifications from the storage task
pub static STORAGE_EVENT: Channel<CriticalSectionRawMutex, StorageEvent, EVENT_CHANNEL_SIZE> =
    Channel::new();
