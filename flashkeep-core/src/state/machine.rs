//! Controller state definition
//!
//! What the scheduler may do next is a function of the current controller
//! state and whether a request is in flight.

use flashkeep_hal::FlashOp;

use super::events::ControllerEvent;

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerState {
    /// Constructed, not initialized
    Unknown,
    /// Initialized, flash storage not ready yet
    Init,
    /// Ready, nothing in flight
    Idle,
    /// A write, update or delete is in flight
    Working,
    /// Flash capacity exhausted, garbage collection pending or running
    Full,
    /// Service queue was full, pending work waits for the next trigger
    QueueBackpressure,
    /// The last operation failed; later requests are still served
    Error(ErrorKind),
}

/// Operations that can fail into the error state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// Storage initialization failed
    Init,
    /// Record creation failed
    Write,
    /// Record replacement failed
    Update,
    /// Record deletion failed
    DeleteRecord,
    /// File deletion failed
    DeleteFile,
    /// Garbage collection failed
    GarbageCollect,
    /// Flash stayed full after garbage collection
    Exhausted,
}

impl From<FlashOp> for ErrorKind {
    fn from(op: FlashOp) -> Self {
        match op {
            FlashOp::Init => ErrorKind::Init,
            FlashOp::Write => ErrorKind::Write,
            FlashOp::Update => ErrorKind::Update,
            FlashOp::DeleteRecord => ErrorKind::DeleteRecord,
            FlashOp::DeleteFile => ErrorKind::DeleteFile,
            FlashOp::GarbageCollect => ErrorKind::GarbageCollect,
        }
    }
}

impl ControllerState {
    /// Check if flash storage has been brought up
    pub fn is_ready(&self) -> bool {
        !matches!(self, ControllerState::Unknown | ControllerState::Init)
    }

    /// Check if this is an error state
    pub fn is_error(&self) -> bool {
        matches!(self, ControllerState::Error(_))
    }

    /// Process an event and return the next state
    ///
    /// Combinations not listed leave the state unchanged.
    pub fn transition(self, event: ControllerEvent) -> Self {
        use ControllerEvent::*;
        use ControllerState::*;

        match (self, event) {
            // Lifecycle
            (_, Initialize) => Init,
            (Init, FlashReady) => Idle,
            (Error(_), FlashReady) => Idle,

            // Issuing work
            (Idle, RequestIssued) => Working,
            (QueueBackpressure, RequestIssued) => Working,
            (Error(_), RequestIssued) => Working,

            // Completions
            (Working, RequestCompleted) => Idle,
            (Working, Retry) => Idle,
            (QueueBackpressure, Drained) => Idle,

            // Capacity
            (Idle | Working | QueueBackpressure | Error(_), QueueFull) => QueueBackpressure,
            (Idle | Working | QueueBackpressure | Error(_), FlashFull) => Full,
            (Full, GarbageCollected) => Idle,

            // Errors are reachable from everywhere
            (_, Failed(kind)) => Error(kind),

            // Default: stay in current state
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_to_idle() {
        let state = ControllerState::Unknown.transition(ControllerEvent::Initialize);
        assert_eq!(state, ControllerState::Init);
        assert!(!state.is_ready());

        let state = state.transition(ControllerEvent::FlashReady);
        assert_eq!(state, ControllerState::Idle);
        assert!(state.is_ready());
    }

    #[test]
    fn test_work_cycle() {
        let working = ControllerState::Idle.transition(ControllerEvent::RequestIssued);
        assert_eq!(working, ControllerState::Working);

        let idle = working.transition(ControllerEvent::RequestCompleted);
        assert_eq!(idle, ControllerState::Idle);

        let retried = working.transition(ControllerEvent::Retry);
        assert_eq!(retried, ControllerState::Idle);
    }

    #[test]
    fn test_full_until_garbage_collected() {
        let full = ControllerState::Working.transition(ControllerEvent::FlashFull);
        assert_eq!(full, ControllerState::Full);

        // Issuing the garbage collection does not leave Full
        assert_eq!(
            full.transition(ControllerEvent::RequestIssued),
            ControllerState::Full
        );
        assert_eq!(
            full.transition(ControllerEvent::RequestCompleted),
            ControllerState::Full
        );
        assert_eq!(
            full.transition(ControllerEvent::GarbageCollected),
            ControllerState::Idle
        );
    }

    #[test]
    fn test_backpressure_recovery() {
        let state = ControllerState::Working.transition(ControllerEvent::QueueFull);
        assert_eq!(state, ControllerState::QueueBackpressure);

        assert_eq!(
            state.transition(ControllerEvent::RequestIssued),
            ControllerState::Working
        );
        assert_eq!(
            state.transition(ControllerEvent::Drained),
            ControllerState::Idle
        );
    }

    #[test]
    fn test_error_from_any_state() {
        let states = [
            ControllerState::Unknown,
            ControllerState::Init,
            ControllerState::Idle,
            ControllerState::Working,
            ControllerState::Full,
            ControllerState::QueueBackpressure,
        ];

        for state in states {
            let next = state.transition(ControllerEvent::Failed(ErrorKind::Write));
            assert_eq!(next, ControllerState::Error(ErrorKind::Write));
        }
    }

    #[test]
    fn test_error_keeps_serving() {
        let error = ControllerState::Error(ErrorKind::DeleteFile);
        assert!(error.is_error());
        assert_eq!(
            error.transition(ControllerEvent::RequestIssued),
            ControllerState::Working
        );
    }

    #[test]
    fn test_unlisted_events_are_ignored() {
        assert_eq!(
            ControllerState::Init.transition(ControllerEvent::RequestCompleted),
            ControllerState::Init
        );
        assert_eq!(
            ControllerState::Idle.transition(ControllerEvent::GarbageCollected),
            ControllerState::Idle
        );
    }

    #[test]
    fn test_error_kind_from_op() {
        assert_eq!(ErrorKind::from(FlashOp::Update), ErrorKind::Update);
        assert_eq!(ErrorKind::from(FlashOp::GarbageCollect), ErrorKind::GarbageCollect);
    }
}
