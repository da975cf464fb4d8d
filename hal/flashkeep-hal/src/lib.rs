//! Flashkeep flash storage abstraction
//!
//! This crate defines the contract of the flash record service that the
//! persistence coordinator drives. A service stores small records addressed
//! by `(file identifier, key)`, answers lookups synchronously and completes
//! writes, updates, deletions and garbage collection asynchronously through
//! [`FlashEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  flashkeep-core (coordinator)           │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  flashkeep-hal (this crate - contract)  │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │   RamFlash    │       │ flashkeep-hal-│
//! │  (host/sim)   │       │      nor      │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Items
//!
//! - [`flash::FlashStorageService`] - the service contract
//! - [`flash::FileId`] - known record categories
//! - [`flash::FlashEvent`] - completion events
//! - [`ram::RamFlash`] - in-memory service with deferred completions
//! - `trace!` to `error!` - logging macros for the flashkeep crates

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

mod fmt;

pub mod flash;
pub mod ram;

// Re-export key types at crate root for convenience
pub use flash::{
    FileId, FlashError, FlashEvent, FlashOp, FlashResult, FlashStorageService, FsStat,
    RecordDescriptor, RecordKey, MAX_RECORD_LEN, RECORD_HEADER_WORDS,
};
pub use ram::RamFlash;
