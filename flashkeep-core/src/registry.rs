//! Persister registry
//!
//! Bounded, ordered list of registered persisters. Entries keep
//! registration order, which is also the order the scheduler drains them
//! in. Keys come from a monotonic counter and are never reused, even after
//! an entry is removed.

use core::cell::RefCell;
use core::fmt;

use flashkeep_hal::{FileId, RecordDescriptor, RecordKey};
use heapless::Vec;

use crate::config::{FIRST_RECORD_KEY, LAST_RECORD_KEY};
use crate::error::Error;
use crate::persister::{Persister, PersisterKey, PersisterStatus, StatusEvent};

/// Shared handle to a client persister
pub type PersisterRef<'a> = &'a RefCell<dyn Persister + 'a>;

/// One registered persister
pub struct Entry<'a> {
    persister: PersisterRef<'a>,
    record: RecordKey,
    status: PersisterStatus,
    descriptor: Option<RecordDescriptor>,
}

impl<'a> Entry<'a> {
    /// Key assigned at registration
    pub fn key(&self) -> PersisterKey {
        PersisterKey(self.record.key)
    }

    /// Record category
    pub fn file_id(&self) -> FileId {
        self.record.file_id
    }

    /// Full record identity
    pub fn record(&self) -> RecordKey {
        self.record
    }

    /// Current status
    pub fn status(&self) -> PersisterStatus {
        self.status
    }

    /// Descriptor of the stored record, once located or written
    pub fn descriptor(&self) -> Option<RecordDescriptor> {
        self.descriptor
    }

    pub(crate) fn persister(&self) -> PersisterRef<'a> {
        self.persister
    }

    pub(crate) fn set_descriptor(&mut self, descriptor: Option<RecordDescriptor>) {
        self.descriptor = descriptor;
    }

    /// Apply a status event, returning the new status
    pub(crate) fn apply(&mut self, event: StatusEvent) -> PersisterStatus {
        self.status = self.status.transition(event);
        self.status
    }

    fn is(&self, persister: PersisterRef<'_>) -> bool {
        core::ptr::addr_eq(self.persister, persister)
    }
}

impl fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("record", &self.record)
            .field("status", &self.status)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Result of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Persister was added under a fresh key
    Added(PersisterKey),
    /// Persister was already registered under this key
    Existing(PersisterKey),
}


/// Ordered registry of up to `N` persisters
pub struct Registry<'a, const N: usize> {
    entries: Vec<Entry<'a>, N>,
    next_key: u32,
}

impl<'a, const N: usize> Registry<'a, N> {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_key: FIRST_RECORD_KEY as u32,
        }
    }

    /// Drop every entry and restart key assignment
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_key = FIRST_RECORD_KEY as u32;
    }

    /// Register a persister under `file_id`
    ///
    /// A persister that is already registered keeps its key and file.
    pub fn insert(
        &mut self,
        persister: PersisterRef<'a>,
        file_id: FileId,
    ) -> Result<Registration, Error> {
        if let Some(entry) = self.entries.iter().find(|e| e.is(persister)) {
            return Ok(Registration::Existing(entry.key()));
        }
        if self.entries.is_full() {
            return Err(Error::RegistryFull);
        }
        if self.next_key > LAST_RECORD_KEY as u32 {
            return Err(Error::KeysExhausted);
        }

        let key = self.next_key as u16;
        let entry = Entry {
            persister,
            record: RecordKey::new(file_id, key),
            status: PersisterStatus::Unknown,
            descriptor: None,
        };
        self.entries.push(entry).map_err(|_| Error::RegistryFull)?;
        self.next_key += 1;
        Ok(Registration::Added(PersisterKey(key)))
    }

    /// Remove an entry, keeping the order of the others
    pub fn remove(&mut self, key: PersisterKey) -> Result<Entry<'a>, Error> {
        let index = self.index_of(key).ok_or(Error::NotRegistered)?;
        if self.entries[index].status.is_in_flight() {
            return Err(Error::InFlight);
        }
        Ok(self.entries.remove(index))
    }

    /// Key of a registered persister
    pub fn key_of(&self, persister: PersisterRef<'_>) -> Option<PersisterKey> {
        self.entries.iter().find(|e| e.is(persister)).map(Entry::key)
    }

    /// Position of the entry with `key`
    pub fn index_of(&self, key: PersisterKey) -> Option<usize> {
        // Entries are in registration order, so keys are ascending
        self.entries
            .binary_search_by_key(&key.0, |e| e.record.key)
            .ok()
    }

    pub fn get(&self, key: PersisterKey) -> Option<&Entry<'a>> {
        self.index_of(key).map(|i| &self.entries[i])
    }

    pub fn get_mut(&mut self, key: PersisterKey) -> Option<&mut Entry<'a>> {
        let index = self.index_of(key)?;
        Some(&mut self.entries[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<'a>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry<'a>> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// First entry, in registration order, waiting for a save or delete
    pub fn first_requested(&self) -> Option<PersisterKey> {
        self.entries
            .iter()
            .find(|e| {
                matches!(
                    e.status,
                    PersisterStatus::SaveRequested | PersisterStatus::ClearRequested
                )
            })
            .map(Entry::key)
    }

    /// Check if every entry holds its last saved state
    pub fn all_saved(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_saved())
    }

    /// Number of entries holding their last saved state
    pub fn saved_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_saved()).count()
    }

    /// Number of entries with work pending or running
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_pending()).count()
    }

    /// Distinct file identifiers in use, in order of first appearance
    ///
    /// Deduplicates by membership, so entries of one file do not have to
    /// be adjacent.
    pub fn file_ids(&self) -> Vec<FileId, N> {
        let mut files: Vec<FileId, N> = Vec::new();
        for entry in &self.entries {
            if !files.contains(&entry.record.file_id) {
                // At most one file per entry, so this always fits
                let _ = files.push(entry.record.file_id);
            }
        }
        files
    }
}

impl<const N: usize> Default for Registry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}
