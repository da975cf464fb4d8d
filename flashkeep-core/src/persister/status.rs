//! Per-record status machine

/// Status of one registered persister's record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PersisterStatus {
    /// Nothing known about the record yet
    #[default]
    Unknown,
    /// Save pending, waiting for the scheduler
    SaveRequested,
    /// Write of a new record in flight
    Saving,
    /// New record written
    Saved,
    /// Stored bytes are being applied
    Restoring,
    /// Restore finished (possibly with nothing stored)
    Restored,
    /// Update of an existing record in flight
    Updating,
    /// Existing record updated
    Updated,
    /// Delete pending, waiting for the scheduler
    ClearRequested,
    /// Record deletion in flight
    Clearing,
    /// Record deleted or never stored
    Cleared,
}

/// Events that move a persister between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusEvent {
    /// Client asked for a save
    RequestSave,
    /// Client asked for a delete
    RequestClear,
    /// Scheduler submitted a write
    WriteIssued,
    /// Scheduler submitted an update
    UpdateIssued,
    /// Scheduler submitted a record deletion
    ClearIssued,
    /// Restore lookup started
    RestoreStarted,
    /// The submitted operation or restore finished successfully
    Completed,
    /// Record is known to be gone (file deleted or never stored)
    Erased,
    /// The submitted operation must be submitted again
    Requeue,
    /// The operation failed for good
    Failed,
}

impl PersisterStatus {
    /// Check if a flash operation or restore for this record is running
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PersisterStatus::Saving
                | PersisterStatus::Updating
                | PersisterStatus::Clearing
                | PersisterStatus::Restoring
        )
    }

    /// Check if the record holds the persister's last saved state
    pub fn is_saved(&self) -> bool {
        matches!(self, PersisterStatus::Saved | PersisterStatus::Updated)
    }

    /// Check if work for this record is pending or running
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PersisterStatus::SaveRequested | PersisterStatus::ClearRequested
        ) || self.is_in_flight()
    }

    /// Process an event and return the next status
    ///
    /// Requests are ignored while an operation is in flight. A restore is
    /// also ignored while a save or delete is waiting.
    pub fn transition(self, event: StatusEvent) -> Self {
        use PersisterStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (s, RequestSave) if !s.is_in_flight() => SaveRequested,
            (s, RequestClear) if !s.is_in_flight() => ClearRequested,
            (s, RestoreStarted) if !s.is_pending() => Restoring,

            (SaveRequested, WriteIssued) => Saving,
            (SaveRequested, UpdateIssued) => Updating,
            (ClearRequested, ClearIssued) => Clearing,

            (Saving, Completed) => Saved,
            (Updating, Completed) => Updated,
            (Clearing, Completed) => Cleared,
            (Restoring, Completed) => Restored,

            (Saving | Updating, Requeue) => SaveRequested,
            (Clearing, Requeue) => ClearRequested,

            (s, Erased) if !s.is_in_flight() => Cleared,

            (_, Failed) => Unknown,

            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_cycle() {
        let status = PersisterStatus::Unknown.transition(StatusEvent::RequestSave);
        assert_eq!(status, PersisterStatus::SaveRequested);
        assert!(status.is_pending());

        let status = status.transition(StatusEvent::WriteIssued);
        assert_eq!(status, PersisterStatus::Saving);
        assert!(status.is_in_flight());

        let status = status.transition(StatusEvent::Completed);
        assert_eq!(status, PersisterStatus::Saved);
        assert!(status.is_saved());
        assert!(!status.is_pending());
    }

    #[test]
    fn test_update_cycle() {
        let status = PersisterStatus::Saved
            .transition(StatusEvent::RequestSave)
            .transition(StatusEvent::UpdateIssued)
            .transition(StatusEvent::Completed);
        assert_eq!(status, PersisterStatus::Updated);
        assert!(status.is_saved());
    }

    #[test]
    fn test_requests_ignored_in_flight() {
        for status in [
            PersisterStatus::Saving,
            PersisterStatus::Updating,
            PersisterStatus::Clearing,
            PersisterStatus::Restoring,
        ] {
            assert_eq!(status.transition(StatusEvent::RequestSave), status);
            assert_eq!(status.transition(StatusEvent::RequestClear), status);
            assert_eq!(status.transition(StatusEvent::Erased), status);
        }
    }

    #[test]
    fn test_restore_keeps_waiting_request() {
        for status in [PersisterStatus::SaveRequested, PersisterStatus::ClearRequested] {
            assert_eq!(status.transition(StatusEvent::RestoreStarted), status);
        }
        assert_eq!(
            PersisterStatus::Saved.transition(StatusEvent::RestoreStarted),
            PersisterStatus::Restoring
        );
    }

    #[test]
    fn test_requeue_returns_to_request() {
        assert_eq!(
            PersisterStatus::Updating.transition(StatusEvent::Requeue),
            PersisterStatus::SaveRequested
        );
        assert_eq!(
            PersisterStatus::Clearing.transition(StatusEvent::Requeue),
            PersisterStatus::ClearRequested
        );
    }

    #[test]
    fn test_clear_cycle() {
        let status = PersisterStatus::Updated
            .transition(StatusEvent::RequestClear)
            .transition(StatusEvent::ClearIssued)
            .transition(StatusEvent::Completed);
        assert_eq!(status, PersisterStatus::Cleared);
    }

    #[test]
    fn test_issue_requires_request() {
        assert_eq!(
            PersisterStatus::Saved.transition(StatusEvent::WriteIssued),
            PersisterStatus::Saved
        );
        assert_eq!(
            PersisterStatus::Unknown.transition(StatusEvent::Completed),
            PersisterStatus::Unknown
        );
    }

    #[test]
    fn test_failure_resets() {
        assert_eq!(
            PersisterStatus::Saving.transition(StatusEvent::Failed),
            PersisterStatus::Unknown
        );
        assert_eq!(
            PersisterStatus::Restoring.transition(StatusEvent::Failed),
            PersisterStatus::Unknown
        );
    }
}
