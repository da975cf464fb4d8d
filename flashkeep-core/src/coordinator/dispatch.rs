//! Completion event dispatch

use flashkeep_hal::{
    FileId, FlashEvent, FlashOp, FlashResult, FlashStorageService, RecordDescriptor,
};

use super::{FlashCoordinator, InFlight};
use crate::error::Error;
use crate::persister::{PersisterKey, StatusEvent};
use crate::state::{ControllerEvent, ErrorKind};

impl<'a, S, const N: usize, const O: usize> FlashCoordinator<'a, S, N, O>
where
    S: FlashStorageService,
{
    /// Drain completion events from the service, then run the scheduler
    ///
    /// Returns the number of events handled. Every event is handled even if
    /// an earlier one failed; the first error is returned.
    pub fn process_events(&mut self) -> Result<usize, Error> {
        let mut handled = 0;
        let mut failure = None;

        while let Some(event) = self.flash.poll_event() {
            handled += 1;
            if let Err(e) = self.on_flash_event(event) {
                failure.get_or_insert(e);
            }
        }
        if let Err(e) = self.process_transaction() {
            failure.get_or_insert(e);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    /// Handle one completion event
    ///
    /// Events that do not complete the submitted request are ignored.
    /// Unexpected result codes move the controller to `Error`, are
    /// reported to observers and returned.
    pub fn on_flash_event(&mut self, event: FlashEvent) -> Result<(), Error> {
        let Some(in_flight) = self.in_flight else {
            warn!("Ignoring {:?}, nothing in flight", event);
            return Ok(());
        };
        if !in_flight.matches(&event) {
            warn!("Ignoring {:?}, waiting for {:?}", event, in_flight);
            return Ok(());
        }
        debug!("Completed {:?}", event);
        self.in_flight = None;

        let outcome = match (in_flight, event) {
            (_, FlashEvent::Init { result }) => self.on_init(result),
            (
                InFlight::Save { key, op },
                FlashEvent::Write {
                    result, descriptor, ..
                }
                | FlashEvent::Update {
                    result, descriptor, ..
                },
            ) => self.on_saved(key, op, result, descriptor),
            (InFlight::Clear { key }, FlashEvent::DeleteRecord { result, .. }) => {
                self.on_record_deleted(key, result)
            }
            (_, FlashEvent::DeleteFile { result, file_id }) => {
                // The sweep continues on its own; the scheduler is not run
                return self.on_file_deleted(file_id, result);
            }
            (_, FlashEvent::GarbageCollect { result }) => self.on_garbage_collected(result),
            _ => Ok(()),
        };

        let scheduled = self.process_transaction();
        outcome.and(scheduled)
    }

    fn on_init(&mut self, result: FlashResult) -> Result<(), Error> {
        match result {
            FlashResult::Success => {
                self.state = self.state.transition(ControllerEvent::FlashReady);
                info!("Flash storage initialized");
                let snapshot = self.snapshot();
                self.observers.initialized(&snapshot);
                Ok(())
            }
            FlashResult::Busy | FlashResult::NoSpaceInQueues => {
                warn!("Flash initialization busy, retrying");
                Ok(())
            }
            result => Err(self.unexpected(FlashOp::Init, result, None)),
        }
    }

    fn on_saved(
        &mut self,
        key: PersisterKey,
        op: FlashOp,
        result: FlashResult,
        descriptor: RecordDescriptor,
    ) -> Result<(), Error> {
        match result {
            FlashResult::Success => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.apply(StatusEvent::Completed);
                    entry.set_descriptor(Some(descriptor));
                }
                self.gc_without_progress = false;
                self.state = self.state.transition(ControllerEvent::RequestCompleted);
                debug!("Persister {} saved", key.get());

                if self.registry.all_saved() {
                    info!("All {} persisters saved", self.registry.len());
                    let snapshot = self.snapshot();
                    self.observers.saved(&snapshot);
                }
                Ok(())
            }
            FlashResult::Busy | FlashResult::NoSpaceInQueues => {
                warn!("Save of {} not processed ({:?}), requeued", key.get(), result);
                self.requeue(key);
                self.state = self.state.transition(ControllerEvent::QueueFull);
                Ok(())
            }
            FlashResult::NoSpaceInFlash => {
                if self.gc_without_progress {
                    return Err(self.flash_exhausted(Some(key)));
                }
                warn!("Flash full saving {}, requeued", key.get());
                self.requeue(key);
                self.state = self.state.transition(ControllerEvent::FlashFull);
                Ok(())
            }
            result => Err(self.unexpected(op, result, Some(key))),
        }
    }

    fn on_record_deleted(&mut self, key: PersisterKey, result: FlashResult) -> Result<(), Error> {
        match result {
            FlashResult::Success => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.apply(StatusEvent::Completed);
                    entry.set_descriptor(None);
                }
                self.gc_without_progress = false;
                self.state = self.state.transition(ControllerEvent::RequestCompleted);
                debug!("Persister {} cleared", key.get());
                let snapshot = self.snapshot();
                self.observers.cleared(&snapshot);
                Ok(())
            }
            FlashResult::Busy | FlashResult::NoSpaceInQueues => {
                warn!("Delete of {} busy, retrying", key.get());
                self.requeue(key);
                self.state = self.state.transition(ControllerEvent::Retry);
                Ok(())
            }
            result => Err(self.unexpected(FlashOp::DeleteRecord, result, Some(key))),
        }
    }

    fn on_file_deleted(&mut self, file_id: FileId, result: FlashResult) -> Result<(), Error> {
        match result {
            FlashResult::Success => {
                for entry in self.registry.iter_mut().filter(|e| e.file_id() == file_id) {
                    entry.apply(StatusEvent::Erased);
                    entry.set_descriptor(None);
                }
                if let Some(index) = self.pending_files.iter().position(|f| *f == file_id) {
                    self.pending_files.remove(index);
                }
                self.gc_without_progress = false;
                self.state = self.state.transition(ControllerEvent::RequestCompleted);
                debug!("File {} cleared", file_id);

                match self.pending_files.first() {
                    Some(&next) => self.issue_delete_file(next),
                    None => {
                        info!("All files cleared");
                        let snapshot = self.snapshot();
                        self.observers.cleared(&snapshot);
                        Ok(())
                    }
                }
            }
            FlashResult::Busy | FlashResult::NoSpaceInQueues => {
                warn!("Delete of file {} busy, waiting for next trigger", file_id);
                self.state = self.state.transition(ControllerEvent::Retry);
                Ok(())
            }
            result => {
                self.pending_files.clear();
                Err(self.unexpected(FlashOp::DeleteFile, result, None))
            }
        }
    }

    fn on_garbage_collected(&mut self, result: FlashResult) -> Result<(), Error> {
        match result {
            FlashResult::Success => {
                self.gc_without_progress = true;
                self.state = self.state.transition(ControllerEvent::GarbageCollected);
                info!("Garbage collection done, {} words used", self.flash.stat().used_words);
                Ok(())
            }
            FlashResult::Busy | FlashResult::NoSpaceInQueues => {
                warn!("Garbage collection busy, retrying");
                self.state = self.state.transition(ControllerEvent::Retry);
                Ok(())
            }
            result => Err(self.unexpected(FlashOp::GarbageCollect, result, None)),
        }
    }

    fn requeue(&mut self, key: PersisterKey) {
        if let Some(entry) = self.registry.get_mut(key) {
            entry.apply(StatusEvent::Requeue);
        }
    }

    /// Record an unexpected result code and report it
    fn unexpected(
        &mut self,
        op: FlashOp,
        result: FlashResult,
        key: Option<PersisterKey>,
    ) -> Error {
        error!("{:?} failed with {:?}", op, result);
        if let Some(entry) = key.and_then(|key| self.registry.get_mut(key)) {
            entry.apply(StatusEvent::Failed);
        }
        self.state = self
            .state
            .transition(ControllerEvent::Failed(ErrorKind::from(op)));
        let error = Error::Unexpected { op, result };
        self.notify_error(error);
        error
    }
}
