//! Flashkeep reference firmware
//!
//! Runs the flash persistence coordinator on an RP2040 board, keeping a
//! boot counter and sensor calibration in the last 64KB of flash.

#![no_std]
#![no_main]

use core::cell::RefCell;

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::flash::Flash;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use flashkeep_core::FlashCoordinator;
use flashkeep_hal::FileId;
use flashkeep_hal_nor::{NorFlashConfig, NorFlashService};

use crate::flash::{BoardFlash, FLASH_SIZE, PARTITION_SIZE};
use crate::observer::ChannelObserver;
use crate::tasks::storage::{BootCount, Calibration, CalibrationBlob};
use crate::tasks::{Coordinator, Slots};

mod channels;
mod flash;
mod observer;
mod tasks;

static COORDINATOR: StaticCell<Coordinator> = StaticCell::new();
static BOOT_COUNT: StaticCell<RefCell<BootCount>> = StaticCell::new();
static CALIBRATION: StaticCell<RefCell<CalibrationBlob>> = StaticCell::new();

static OBSERVER: ChannelObserver = ChannelObserver;

/// Main entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Flashkeep firmware starting...");

    let p = embassy_rp::init(Default::default());

    let flash = BoardFlash::new(Flash::new(p.FLASH, p.DMA_CH2));
    let config = NorFlashConfig::tail(FLASH_SIZE as u32, PARTITION_SIZE as u32);
    info!(
        "Record partition {:#x}..{:#x}",
        config.range.start,
        config.range.end
    );

    let coordinator = COORDINATOR.init(FlashCoordinator::new(NorFlashService::new(flash, config)));
    coordinator.initialize().unwrap();
    coordinator.add_observer(&OBSERVER).unwrap();

    let boot_count: &'static RefCell<BootCount> =
        BOOT_COUNT.init(RefCell::new(BootCount::new(0).unwrap()));
    let calibration: &'static RefCell<CalibrationBlob> =
        CALIBRATION.init(RefCell::new(CalibrationBlob::new(Calibration::default()).unwrap()));

    let slots = Slots {
        boot_count,
        boot_count_key: coordinator
            .add_persister(boot_count, FileId::Counters)
            .unwrap(),
        calibration,
        calibration_key: coordinator
            .add_persister(calibration, FileId::Calibration)
            .unwrap(),
    };

    spawner.spawn(tasks::status_task()).unwrap();
    spawner.spawn(tasks::storage_task(coordinator, slots)).unwrap();

    info!("All tasks spawned");

    loop {
        embassy_time::Timer::after_secs(60).await;
    }
}
