//! NOR flash record service
//!
//! Implements the `flashkeep-hal` service contract on any async NOR flash
//! partition, using sequential-storage maps for wear leveling.
//!
//! - [`service::NorFlashService`] - the record service
//! - [`service::NorFlashConfig`] - partition layout

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
extern crate flashkeep_hal;

pub mod service;

// Re-export the shared contract for convenience
pub use flashkeep_hal::{FlashStorageService, RecordKey};
pub use service::{NorFlashConfig, NorFlashService};
