//! Coordinator errors

use flashkeep_hal::{FlashError, FlashOp, FlashResult};

use crate::persister::DecodeError;

/// Errors returned by coordinator operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// `enable()` has not been called
    NotEnabled,
    /// Flash initialization has not completed
    NotReady,
    /// No persister with that key is registered
    NotRegistered,
    /// The persister has a flash operation in flight
    InFlight,
    /// The persister's state is borrowed by its client
    Borrowed,
    /// The registry has no free slot
    RegistryFull,
    /// Every record key has been handed out
    KeysExhausted,
    /// The observer list has no free slot
    ObserversFull,
    /// File identifier is not in the known-category table
    InvalidFileId(u16),
    /// Stored bytes were rejected by the persister
    Decode(DecodeError),
    /// Flash is full even after garbage collection
    FlashExhausted,
    /// The flash service refused a synchronous call
    Flash(FlashError),
    /// A completion carried a result the coordinator cannot recover from
    Unexpected { op: FlashOp, result: FlashResult },
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}
