//! Persister contract
//!
//! A persister is a client-owned blob of state that the coordinator saves
//! to and restores from one flash record. The client implements
//! [`Persister`]; record identity and status are kept by the coordinator.

mod blob;
mod status;

pub use blob::PostcardBlob;
pub use status::{PersisterStatus, StatusEvent};

/// Key handed out by the coordinator at registration
///
/// Keys are assigned in increasing order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PersisterKey(pub u16);

impl PersisterKey {
    /// Raw key value as stored in the record identity
    pub fn get(self) -> u16 {
        self.0
    }
}

/// Stored bytes could not be applied to a persister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Record is shorter than the expected encoding
    Truncated,
    /// Record contents are not a valid encoding
    Malformed,
    /// Record decoded but the value was rejected
    Rejected,
}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        match e {
            postcard::Error::DeserializeUnexpectedEnd => DecodeError::Truncated,
            _ => DecodeError::Malformed,
        }
    }
}

/// Client side of a persisted record
///
/// Neither method may call back into the coordinator.
pub trait Persister {
    /// Current state as bytes to store
    fn serialize(&self) -> &[u8];

    /// Replace the current state with previously stored bytes
    ///
    /// Called at most once per successful restore.
    fn deserialize(&mut self, data: &[u8]) -> Result<(), DecodeError>;
}
