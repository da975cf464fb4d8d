//! Flash persistence coordinator
//!
//! [`FlashCoordinator`] multiplexes registered persisters onto one flash
//! record service. Client calls mark persister status and then run the
//! transaction scheduler, which submits at most one request at a time.
//! Completion events are fed back through
//! [`process_events`](FlashCoordinator::process_events) or
//! [`on_flash_event`](FlashCoordinator::on_flash_event).
//!
//! # Usage
//!
//! ```ignore
//! let mut coordinator: FlashCoordinator<'_, _> = FlashCoordinator::new(service);
//! coordinator.initialize()?;
//! let key = coordinator.add_persister(&calibration, FileId::Calibration)?;
//! coordinator.enable()?;
//!
//! coordinator.save_persister(key)?;
//! loop {
//!     coordinator.process_events()?;
//! }
//! ```
//!
//! All entry points take `&mut self`; the owner must call them from one
//! execution context.

mod dispatch;
mod scheduler;


use flashkeep_hal::{
    FileId, FlashError, FlashEvent, FlashOp, FlashStorageService, FsStat, RecordDescriptor,
};
use heapless::Vec;

use crate::config::{MAX_OBSERVERS, MAX_PERSISTERS};
use crate::error::Error;
use crate::observer::{CoordinatorSnapshot, FlashObserver, ObserverList};
use crate::persister::{PersisterKey, PersisterStatus, StatusEvent};
use crate::registry::{Entry, PersisterRef, Registration, Registry};
use crate::state::{ControllerEvent, ControllerState};

/// Outcome of a successful restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RestoreOutcome {
    /// Stored bytes were applied to the persister
    Applied,
    /// No record exists; the persister was left untouched
    NothingStored,
}

/// The request currently submitted to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum InFlight {
    Init,
    Save { key: PersisterKey, op: FlashOp },
    Clear { key: PersisterKey },
    DeleteFile(FileId),
    GarbageCollect,
}

impl InFlight {
    fn op(self) -> FlashOp {
        match self {
            InFlight::Init => FlashOp::Init,
            InFlight::Save { op, .. } => op,
            InFlight::Clear { .. } => FlashOp::DeleteRecord,
            InFlight::DeleteFile(_) => FlashOp::DeleteFile,
            InFlight::GarbageCollect => FlashOp::GarbageCollect,
        }
    }

    /// Check if `event` completes this request
    fn matches(self, event: &FlashEvent) -> bool {
        match (self, *event) {
            (InFlight::DeleteFile(expected), FlashEvent::DeleteFile { file_id, .. }) => {
                expected == file_id
            }
            (in_flight, event) => in_flight.op() == event.op(),
        }
    }
}

/// Coordinator of up to `N` persisters and `O` observers
pub struct FlashCoordinator<'a, S, const N: usize = MAX_PERSISTERS, const O: usize = MAX_OBSERVERS>
{
    flash: S,
    state: ControllerState,
    enabled: bool,
    registry: Registry<'a, N>,
    observers: ObserverList<'a, O>,
    in_flight: Option<InFlight>,
    /// Files still to delete in a running clear-all sweep
    pending_files: Vec<FileId, N>,
    /// Set by a garbage collection, cleared by any successful write,
    /// update or delete
    gc_without_progress: bool,
}

impl<'a, S, const N: usize, const O: usize> FlashCoordinator<'a, S, N, O>
where
    S: FlashStorageService,
{
    /// Create a coordinator driving `flash`
    pub fn new(flash: S) -> Self {
        Self {
            flash,
            state: ControllerState::Unknown,
            enabled: false,
            registry: Registry::new(),
            observers: ObserverList::new(),
            in_flight: None,
            pending_files: Vec::new(),
            gc_without_progress: false,
        }
    }

    /// Reset the registry and key counter and enter `Init`
    ///
    /// Refused while a request is submitted, since its completion would
    /// land on the reset registry.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if let Some(in_flight) = self.in_flight {
            warn!("Cannot initialize, waiting for {:?}", in_flight);
            return Err(Error::InFlight);
        }
        self.registry.reset();
        self.pending_files.clear();
        self.enabled = false;
        self.gc_without_progress = false;
        self.state = self.state.transition(ControllerEvent::Initialize);
        debug!("Coordinator initialized");
        Ok(())
    }

    /// Connect to the flash service and start accepting persister requests
    ///
    /// If the service is already initialized the coordinator goes straight
    /// to `Idle`, otherwise the one-time flash initialization is submitted.
    /// Calling it again re-triggers a busy initialization.
    pub fn enable(&mut self) -> Result<(), Error> {
        if self.enabled {
            return self.process_transaction();
        }
        if self.state == ControllerState::Unknown {
            self.state = self.state.transition(ControllerEvent::Initialize);
        }

        self.flash.register_event_handler()?;
        let stat = self.flash.stat();
        debug!(
            "Flash: {} valid, {} dirty records, {} words used, {} freeable",
            stat.valid_records,
            stat.dirty_records,
            stat.used_words,
            stat.freeable_words
        );
        self.enabled = true;

        if self.flash.is_initialized() {
            self.state = self.state.transition(ControllerEvent::FlashReady);
            info!("Flash storage ready");
            let snapshot = self.snapshot();
            self.observers.initialized(&snapshot);
            Ok(())
        } else {
            info!("Flash storage needs initialization");
            self.process_transaction()
        }
    }

    /// Register an observer
    pub fn add_observer(&mut self, observer: &'a dyn FlashObserver) -> Result<(), Error> {
        self.observers.add(observer)
    }

    /// Register a persister under `file_id`
    ///
    /// Registering the same persister again returns its existing key. A
    /// full registry is reported to observers and returned as an error.
    pub fn add_persister(
        &mut self,
        persister: PersisterRef<'a>,
        file_id: FileId,
    ) -> Result<PersisterKey, Error> {
        match self.registry.insert(persister, file_id) {
            Ok(Registration::Added(key)) => {
                debug!("Registered persister {} in file {}", key.get(), file_id);
                Ok(key)
            }
            Ok(Registration::Existing(key)) => Ok(key),
            Err(e) => {
                error!("Cannot register persister: {:?}", e);
                self.notify_error(e);
                Err(e)
            }
        }
    }

    /// Register a persister under a raw file identifier
    pub fn add_persister_raw(
        &mut self,
        persister: PersisterRef<'a>,
        file_id: u16,
    ) -> Result<PersisterKey, Error> {
        let file_id = FileId::from_u16(file_id).ok_or(Error::InvalidFileId(file_id))?;
        self.add_persister(persister, file_id)
    }

    /// Unregister a persister
    ///
    /// Its key is not handed out again. Fails while the persister has an
    /// operation in flight.
    pub fn remove_persister(&mut self, key: PersisterKey) -> Result<(), Error> {
        let entry = self.registry.remove(key)?;
        debug!("Removed persister {} ({:?})", key.get(), entry.status());
        Ok(())
    }

    /// Request a save of one persister
    ///
    /// Ignored while the persister has an operation in flight.
    pub fn save_persister(&mut self, key: PersisterKey) -> Result<(), Error> {
        self.require_enabled()?;
        let entry = self.registry.get_mut(key).ok_or(Error::NotRegistered)?;
        if entry.status().is_in_flight() {
            debug!("Persister {} busy, save skipped", key.get());
        } else {
            entry.apply(StatusEvent::RequestSave);
        }
        self.process_transaction()
    }

    /// Request a save of every persister not already in flight
    pub fn save_all(&mut self) -> Result<(), Error> {
        self.require_enabled()?;
        for entry in self.registry.iter_mut() {
            entry.apply(StatusEvent::RequestSave);
        }
        debug!("Save requested for {} persisters", self.registry.pending_count());
        self.process_transaction()
    }

    /// Apply the stored record of one persister
    ///
    /// Lookup, open and close are synchronous, so the restore is finished
    /// when this returns. A missing record is not an error. Fails with
    /// `InFlight` while a save or delete of the persister is pending, so
    /// the pending request is not lost.
    pub fn restore_persister(&mut self, key: PersisterKey) -> Result<RestoreOutcome, Error> {
        self.require_ready()?;
        let entry = self.registry.get_mut(key).ok_or(Error::NotRegistered)?;
        if entry.status().is_pending() {
            return Err(Error::InFlight);
        }
        entry.apply(StatusEvent::RestoreStarted);
        let record = entry.record();
        let persister = entry.persister();

        let descriptor = match self.flash.find(record) {
            Ok(descriptor) => descriptor,
            Err(FlashError::NotFound) => {
                self.finish_restore(key, StatusEvent::Completed, None);
                debug!("Nothing stored for persister {}", key.get());
                return Ok(RestoreOutcome::NothingStored);
            }
            Err(e) => return Err(self.restore_failed(key, Error::Flash(e))),
        };

        let applied = match self.flash.open(descriptor) {
            Ok(data) => match persister.try_borrow_mut() {
                Ok(mut persister) => persister.deserialize(data).map_err(Error::Decode),
                Err(_) => Err(Error::Borrowed),
            },
            Err(e) => return Err(self.restore_failed(key, Error::Flash(e))),
        };
        if let Err(e) = self.flash.close(descriptor) {
            warn!("Closing record {} failed: {:?}", key.get(), e);
        }

        match applied {
            Ok(()) => {
                self.finish_restore(key, StatusEvent::Completed, Some(descriptor));
                debug!("Restored persister {}", key.get());
                Ok(RestoreOutcome::Applied)
            }
            Err(e) => {
                warn!("Persister {} rejected stored data: {:?}", key.get(), e);
                self.finish_restore(key, StatusEvent::Failed, None);
                Err(e)
            }
        }
    }

    /// Restore every persister in registry order
    ///
    /// Stops at the first failure. Persisters restored before it stay
    /// restored; observers are only told when every restore succeeded.
    pub fn restore_all(&mut self) -> Result<(), Error> {
        self.require_ready()?;
        let keys: Vec<PersisterKey, N> = self.registry.iter().map(Entry::key).collect();
        for key in keys {
            self.restore_persister(key)?;
        }
        info!("Restored {} persisters", self.registry.len());
        let snapshot = self.snapshot();
        self.observers.restored(&snapshot);
        Ok(())
    }

    /// Delete the record of one persister
    ///
    /// A persister without a stored record is cleared right away.
    pub fn clear_persister(&mut self, key: PersisterKey) -> Result<(), Error> {
        self.require_enabled()?;
        let entry = self.registry.get(key).ok_or(Error::NotRegistered)?;
        if entry.status().is_in_flight() {
            return Err(Error::InFlight);
        }
        let record = entry.record();

        match self.flash.find(record) {
            Ok(descriptor) => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.set_descriptor(Some(descriptor));
                    entry.apply(StatusEvent::RequestClear);
                }
                self.process_transaction()
            }
            Err(FlashError::NotFound) => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.set_descriptor(None);
                    entry.apply(StatusEvent::Erased);
                }
                debug!("Nothing stored for persister {}, cleared", key.get());
                let snapshot = self.snapshot();
                self.observers.cleared(&snapshot);
                Ok(())
            }
            Err(e) => {
                error!("Lookup for clear of {} failed: {:?}", key.get(), e);
                self.notify_error(Error::Flash(e));
                Err(Error::Flash(e))
            }
        }
    }

    /// Delete every file that a registered persister uses
    ///
    /// Each file is deleted once, however its persisters are spread over
    /// the registry. Files are deleted one at a time; observers are told
    /// when the last one is gone.
    pub fn clear_all(&mut self) -> Result<(), Error> {
        self.require_enabled()?;
        if self.registry.is_empty() {
            let snapshot = self.snapshot();
            self.observers.cleared(&snapshot);
            return Ok(());
        }
        if self.clear_in_progress() {
            debug!("Clear already in progress");
            return Ok(());
        }
        self.pending_files = self.registry.file_ids();
        debug!("Clearing {} files", self.pending_files.len());
        self.process_transaction()
    }

    /// Run the scheduler once more
    ///
    /// Pending work parked by backpressure only moves when something runs
    /// the scheduler; this is the explicit way to do that.
    pub fn retry(&mut self) -> Result<(), Error> {
        self.require_enabled()?;
        self.process_transaction()
    }

    /// Controller state
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Check if [`enable`](Self::enable) has been called
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check if a request is submitted and not yet completed
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Status of a registered persister
    pub fn status(&self, key: PersisterKey) -> Option<PersisterStatus> {
        self.registry.get(key).map(Entry::status)
    }

    /// Registry entry of a persister
    pub fn entry(&self, key: PersisterKey) -> Option<&Entry<'a>> {
        self.registry.get(key)
    }

    /// Key of a registered persister
    pub fn key_of(&self, persister: PersisterRef<'_>) -> Option<PersisterKey> {
        self.registry.key_of(persister)
    }

    /// Registered persisters in registry order
    pub fn entries(&self) -> impl Iterator<Item = &Entry<'a>> {
        self.registry.iter()
    }

    /// Storage usage reported by the service
    pub fn stat(&self) -> FsStat {
        self.flash.stat()
    }

    /// Snapshot of the coordinator as passed to observers
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state,
            registered: self.registry.len(),
            saved: self.registry.saved_count(),
            pending: self.registry.pending_count(),
        }
    }

    /// The flash service
    pub fn flash(&self) -> &S {
        &self.flash
    }

    /// Give the flash service back, dropping the coordinator
    pub fn into_flash(self) -> S {
        self.flash
    }

    /// The flash service, mutably
    ///
    /// Submitting requests through it bypasses the single-flight
    /// bookkeeping.
    pub fn flash_mut(&mut self) -> &mut S {
        &mut self.flash
    }

    fn require_enabled(&self) -> Result<(), Error> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::NotEnabled)
        }
    }

    fn require_ready(&self) -> Result<(), Error> {
        self.require_enabled()?;
        if self.state.is_ready() && self.flash.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn clear_in_progress(&self) -> bool {
        !self.pending_files.is_empty() || matches!(self.in_flight, Some(InFlight::DeleteFile(_)))
    }

    fn finish_restore(
        &mut self,
        key: PersisterKey,
        event: StatusEvent,
        descriptor: Option<RecordDescriptor>,
    ) {
        if let Some(entry) = self.registry.get_mut(key) {
            entry.apply(event);
            entry.set_descriptor(descriptor);
        }
    }

    fn restore_failed(&mut self, key: PersisterKey, error: Error) -> Error {
        error!("Restore of persister {} failed: {:?}", key.get(), error);
        self.finish_restore(key, StatusEvent::Failed, None);
        self.notify_error(error);
        error
    }

    fn notify_error(&self, error: Error) {
        let snapshot = self.snapshot();
        self.observers.error(&snapshot, error);
    }
}
