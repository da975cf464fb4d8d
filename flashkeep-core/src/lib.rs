//! Board-agnostic flash persistence coordinator
//!
//! This crate multiplexes many client persisters onto one flash record
//! service without any client having to know about flash concurrency or
//! capacity limits:
//!
//! - Persister contract and per-record status machine
//! - Controller state machine
//! - Persister registry with monotonic key assignment
//! - Transaction scheduler (single request in flight, backpressure,
//!   garbage collection)
//! - Completion event dispatch and observer notification

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
extern crate flashkeep_hal;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod observer;
pub mod persister;
pub mod registry;
pub mod state;

pub use coordinator::{FlashCoordinator, RestoreOutcome};
pub use error::Error;
pub use observer::{CoordinatorSnapshot, FlashObserver};
pub use persister::{DecodeError, Persister, PersisterKey, PersisterStatus, PostcardBlob};
pub use registry::{Entry, PersisterRef};
pub use state::{ControllerState, ErrorKind};
