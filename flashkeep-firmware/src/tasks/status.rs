//! Storage status task
//!
//! Consumes coordinator notifications. Exhausted flash is answered with a
//! full clear so later saves can land again.

use defmt::*;

use flashkeep_core::Error;

use crate::channels::{StorageEvent, StorageRequest, STORAGE_EVENT, STORAGE_REQUEST};

#[embassy_executor::task]
pub async fn status_task() {
    info!("Status task started");

    let mut saves: u32 = 0;
    loop {
        match STORAGE_EVENT.receive().await {
            StorageEvent::Initialized => info!("Storage initialized"),
            StorageEvent::Saved => {
                saves = saves.wrapping_add(1);
                debug!("Storage in sync ({} times)", saves);
            }
            StorageEvent::Restored => info!("Storage restored"),
            StorageEvent::Cleared => info!("Storage cleared"),
            StorageEvent::Failed(Error::FlashExhausted) => {
                error!("Record partition exhausted, clearing");
                STORAGE_REQUEST.send(StorageRequest::ClearAll).await;
            }
            StorageEvent::Failed(e) => warn!("Storage failure: {:?}", e),
        }
    }
}
