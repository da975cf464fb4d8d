//! Transaction scheduler
//!
//! Runs after every client call and every completion. While nothing is in
//! flight it picks the next piece of work by controller state:
//!
//! | State | Next request |
//! |-------|--------------|
//! | `Init` (or failed before flash was initialized) | initialization |
//! | `Full` | garbage collection |
//! | otherwise | next clear-all file deletion, then the first persister in registry order with a save or delete pending |

use flashkeep_hal::{FileId, FlashError, FlashOp, FlashStorageService};

use super::{FlashCoordinator, InFlight};
use crate::error::Error;
use crate::persister::{PersisterKey, PersisterStatus, StatusEvent};
use crate::state::{ControllerEvent, ControllerState, ErrorKind};

/// What became of the work picked for one persister
enum Pick {
    /// A request was submitted or the scheduler has to wait
    Stop,
    /// Resolved without a request; look for more work
    Next,
}

impl<'a, S, const N: usize, const O: usize> FlashCoordinator<'a, S, N, O>
where
    S: FlashStorageService,
{
    /// Submit the next request if nothing is in flight
    pub(crate) fn process_transaction(&mut self) -> Result<(), Error> {
        if !self.enabled || self.in_flight.is_some() {
            return Ok(());
        }

        match self.state {
            ControllerState::Unknown => Ok(()),
            ControllerState::Init => self.issue_init(),
            ControllerState::Error(_) if !self.flash.is_initialized() => self.issue_init(),
            ControllerState::Full => self.issue_garbage_collect(),
            ControllerState::Idle
            | ControllerState::Working
            | ControllerState::QueueBackpressure
            | ControllerState::Error(_) => self.issue_next(),
        }
    }

    fn issue_next(&mut self) -> Result<(), Error> {
        if let Some(&file_id) = self.pending_files.first() {
            return self.issue_delete_file(file_id);
        }

        while let Some(key) = self.registry.first_requested() {
            if let Pick::Stop = self.issue_for(key)? {
                return Ok(());
            }
        }

        if self.state == ControllerState::QueueBackpressure {
            debug!("Backlog drained");
            self.state = self.state.transition(ControllerEvent::Drained);
        }
        Ok(())
    }

    fn issue_for(&mut self, key: PersisterKey) -> Result<Pick, Error> {
        let Some(entry) = self.registry.get(key) else {
            return Ok(Pick::Next);
        };
        let status = entry.status();
        let record = entry.record();
        let persister = entry.persister();

        let found = match self.flash.find(record) {
            Ok(descriptor) => Some(descriptor),
            Err(FlashError::NotFound) => None,
            Err(e) => {
                let op = match status {
                    PersisterStatus::ClearRequested => FlashOp::DeleteRecord,
                    _ => FlashOp::Write,
                };
                return self.submission_failed(op, Some(key), e).map(|_| Pick::Stop);
            }
        };

        match (status, found) {
            (PersisterStatus::SaveRequested, found) => {
                let Ok(data) = persister.try_borrow() else {
                    warn!("Persister {} borrowed, save deferred", key.get());
                    self.state = self.state.transition(ControllerEvent::QueueFull);
                    return Ok(Pick::Stop);
                };
                let (op, submitted) = match found {
                    Some(descriptor) => (
                        FlashOp::Update,
                        self.flash.update(descriptor, data.serialize()),
                    ),
                    None => (FlashOp::Write, self.flash.write(record, data.serialize())),
                };
                drop(data);

                match submitted {
                    Ok(()) => {
                        let event = match op {
                            FlashOp::Update => StatusEvent::UpdateIssued,
                            _ => StatusEvent::WriteIssued,
                        };
                        if let Some(entry) = self.registry.get_mut(key) {
                            entry.apply(event);
                            entry.set_descriptor(found);
                        }
                        self.issued(InFlight::Save { key, op });
                        Ok(Pick::Stop)
                    }
                    Err(e) => self.submission_failed(op, Some(key), e).map(|_| Pick::Stop),
                }
            }
            (PersisterStatus::ClearRequested, Some(descriptor)) => {
                match self.flash.delete_record(descriptor) {
                    Ok(()) => {
                        if let Some(entry) = self.registry.get_mut(key) {
                            entry.apply(StatusEvent::ClearIssued);
                            entry.set_descriptor(Some(descriptor));
                        }
                        self.issued(InFlight::Clear { key });
                        Ok(Pick::Stop)
                    }
                    Err(e) => self
                        .submission_failed(FlashOp::DeleteRecord, Some(key), e)
                        .map(|_| Pick::Stop),
                }
            }
            (PersisterStatus::ClearRequested, None) => {
                // Record vanished since the clear was requested
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.apply(StatusEvent::Erased);
                    entry.set_descriptor(None);
                }
                let snapshot = self.snapshot();
                self.observers.cleared(&snapshot);
                Ok(Pick::Next)
            }
            _ => Ok(Pick::Stop),
        }
    }

    pub(crate) fn issue_init(&mut self) -> Result<(), Error> {
        match self.flash.init() {
            Ok(()) => {
                self.issued(InFlight::Init);
                Ok(())
            }
            Err(e) => self.submission_failed(FlashOp::Init, None, e),
        }
    }

    pub(crate) fn issue_garbage_collect(&mut self) -> Result<(), Error> {
        let stat = self.flash.stat();
        info!(
            "Garbage collecting, {} words freeable of {} used",
            stat.freeable_words,
            stat.used_words
        );
        match self.flash.garbage_collect() {
            Ok(()) => {
                self.issued(InFlight::GarbageCollect);
                Ok(())
            }
            Err(e) => self.submission_failed(FlashOp::GarbageCollect, None, e),
        }
    }

    pub(crate) fn issue_delete_file(&mut self, file_id: FileId) -> Result<(), Error> {
        match self.flash.delete_file(file_id) {
            Ok(()) => {
                self.issued(InFlight::DeleteFile(file_id));
                Ok(())
            }
            Err(e) => self.submission_failed(FlashOp::DeleteFile, None, e),
        }
    }

    fn issued(&mut self, request: InFlight) {
        debug!("Submitted {:?}", request);
        self.in_flight = Some(request);
        // Initialization leaves the state alone so its completion can
        // bring an `Error` controller straight back to `Idle`
        if request != InFlight::Init {
            self.state = self.state.transition(ControllerEvent::RequestIssued);
        }
    }

    /// React to a request the service refused to accept
    fn submission_failed(
        &mut self,
        op: FlashOp,
        key: Option<PersisterKey>,
        error: FlashError,
    ) -> Result<(), Error> {
        match (op, error) {
            (_, FlashError::NoSpaceInQueues | FlashError::Busy) => {
                warn!("{:?} not accepted ({:?}), waiting for next trigger", op, error);
                self.state = self.state.transition(ControllerEvent::QueueFull);
                Ok(())
            }
            (FlashOp::Write | FlashOp::Update, FlashError::NoSpaceInFlash) => {
                if self.gc_without_progress {
                    return Err(self.flash_exhausted(key));
                }
                warn!("Flash full, collecting garbage");
                self.state = self.state.transition(ControllerEvent::FlashFull);
                self.issue_garbage_collect()
            }
            _ => {
                error!("{:?} rejected: {:?}", op, error);
                if op == FlashOp::DeleteFile {
                    self.pending_files.clear();
                }
                if let Some(entry) = key.and_then(|key| self.registry.get_mut(key)) {
                    entry.apply(StatusEvent::Failed);
                }
                self.state = self
                    .state
                    .transition(ControllerEvent::Failed(ErrorKind::from(op)));
                self.notify_error(Error::Flash(error));
                Err(Error::Flash(error))
            }
        }
    }

    /// Give up on a record that does not fit even after garbage collection
    pub(crate) fn flash_exhausted(&mut self, key: Option<PersisterKey>) -> Error {
        error!("Flash exhausted after garbage collection");
        if let Some(entry) = key.and_then(|key| self.registry.get_mut(key)) {
            entry.apply(StatusEvent::Failed);
        }
        self.gc_without_progress = false;
        self.state = self
            .state
            .transition(ControllerEvent::Failed(ErrorKind::Exhausted));
        self.notify_error(Error::FlashExhausted);
        Error::FlashExhausted
    }
}
