//! Storage task
//!
//! Owns the flash coordinator. Drives the NOR service queue, restores
//! state once flash is usable and serves requests from
//! [`STORAGE_REQUEST`]. Until the restore went through, requests that
//! would write the slots are dropped so defaults never replace stored
//! data.

use core::cell::RefCell;

use defmt::*;
use embassy_futures::select::{select, Either};
use embassy_time::{Duration, Timer};
use serde::{Deserialize, Serialize};

use flashkeep_core::{ControllerState, Error, FlashCoordinator, PersisterKey, PostcardBlob};
use flashkeep_hal_nor::NorFlashService;

use crate::channels::{CalibrationUpdate, Slot, StorageRequest, STORAGE_REQUEST};
use crate::flash::BoardFlash;

/// Idle period after which the coordinator is kicked again
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub type Coordinator = FlashCoordinator<'static, NorFlashService<BoardFlash>>;

/// Sensor calibration kept across reboots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: i16,
    pub gain_x1000: u16,
}

impl From<CalibrationUpdate> for Calibration {
    fn from(update: CalibrationUpdate) -> Self {
        Self {
            offset: update.offset,
            gain_x1000: update.gain_x1000,
        }
    }
}

pub type BootCount = PostcardBlob<u32, 8>;

pub type CalibrationBlob = PostcardBlob<Calibration, 8>;

/// Persisted slots and their registration keys
pub struct Slots {
    pub boot_count: &'static RefCell<BootCount>,
    pub boot_count_key: PersisterKey,
    pub calibration: &'static RefCell<CalibrationBlob>,
    pub calibration_key: PersisterKey,
}

impl Slots {
    fn key(&self, slot: Slot) -> PersisterKey {
        match slot {
            Slot::BootCount => self.boot_count_key,
            Slot::Calibration => self.calibration_key,
        }
    }

    fn keys(&self) -> [PersisterKey; 2] {
        [self.boot_count_key, self.calibration_key]
    }
}

/// Execute queued flash requests and dispatch their completions
///
/// Stops at the first failed completion; the retry timer picks the queue
/// up again, so a failing flash is not hammered.
async fn pump(coordinator: &mut Coordinator) {
    loop {
        if let Err(e) = coordinator.process_events() {
            warn!("Storage completion failed: {:?}", e);
            break;
        }
        if !coordinator.flash().has_pending() {
            break;
        }
        coordinator.flash_mut().process().await;
    }
}

/// Apply the stored slots
///
/// Returns `false` while flash is not usable. A slot whose stored bytes
/// are rejected keeps its default.
fn restore(coordinator: &mut Coordinator, slots: &Slots) -> bool {
    match coordinator.restore_all() {
        Ok(()) => return true,
        Err(Error::Decode(e)) => warn!("Stored slot rejected: {:?}", e),
        Err(e) => {
            debug!("Restore not possible yet: {:?}", e);
            return false;
        }
    }

    // The rejected slot stopped the sweep; pick up the others
    for key in slots.keys() {
        match coordinator.restore_persister(key) {
            Ok(_) => {}
            Err(Error::Decode(_)) => warn!("Slot {} keeps its default", key.get()),
            Err(e) => {
                warn!("Restore of slot {} failed: {:?}", key.get(), e);
                return false;
            }
        }
    }
    true
}

/// Restore the slots and count this boot
///
/// Returns `false`, touching nothing, while flash is not usable.
async fn start(coordinator: &mut Coordinator, slots: &Slots) -> bool {
    if !restore(coordinator, slots) {
        warn!(
            "Storage not ready ({:?}), boot not counted yet",
            coordinator.state()
        );
        return false;
    }

    let boots = {
        let mut boot_count = slots.boot_count.borrow_mut();
        if boot_count.modify(|n| *n = n.wrapping_add(1)).is_err() {
            warn!("Boot count does not fit its record");
        }
        *boot_count.get()
    };
    info!(
        "Boot {}, calibration offset={} gain={}",
        boots,
        slots.calibration.borrow().get().offset,
        slots.calibration.borrow().get().gain_x1000
    );

    if let Err(e) = coordinator.save_persister(slots.boot_count_key) {
        warn!("Cannot save boot count: {:?}", e);
    }
    pump(coordinator).await;
    true
}

/// Kick a stalled coordinator
fn retry(coordinator: &mut Coordinator) {
    let result = if !coordinator.is_enabled() {
        coordinator.enable()
    } else {
        let state = coordinator.state();
        if matches!(state, ControllerState::Init | ControllerState::QueueBackpressure)
            || state.is_error()
        {
            coordinator.retry()
        } else {
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("Retry failed: {:?}", e);
    }
}

fn handle(coordinator: &mut Coordinator, slots: &Slots, request: StorageRequest) {
    let result = match request {
        StorageRequest::SetCalibration(update) => {
            let stored = slots.calibration.borrow_mut().set(update.into());
            match stored {
                Ok(()) => coordinator.save_persister(slots.calibration_key),
                Err(_) => {
                    warn!("Calibration does not fit its record");
                    Ok(())
                }
            }
        }
        StorageRequest::Save(slot) => coordinator.save_persister(slots.key(slot)),
        StorageRequest::SaveAll => coordinator.save_all(),
        StorageRequest::ClearAll => coordinator.clear_all(),
        StorageRequest::Retry => {
            retry(coordinator);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("{:?} failed: {:?}", request, e);
    }
}

/// Storage task - the only owner of the flash coordinator
#[embassy_executor::task]
pub async fn storage_task(coordinator: &'static mut Coordinator, slots: Slots) {
    info!("Storage task started");

    if let Err(e) = coordinator.enable() {
        error!("Cannot enable storage: {:?}", e);
    }
    pump(coordinator).await;
    let mut restored = start(coordinator, &slots).await;

    loop {
        match select(STORAGE_REQUEST.receive(), Timer::after(RETRY_INTERVAL)).await {
            Either::First(request) if restored || matches!(request, StorageRequest::Retry) => {
                debug!("Storage request {:?}", request);
                handle(coordinator, &slots, request);
            }
            Either::First(request) => warn!("Storage not restored, dropping {:?}", request),
            Either::Second(()) => retry(coordinator),
        }
        pump(coordinator).await;

        if !restored {
            restored = start(coordinator, &slots).await;
        }
    }
}
