//! Events that trigger controller transitions

use super::machine::ErrorKind;

/// Events that can trigger controller transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerEvent {
    // Lifecycle events
    /// Registry and counters were reset
    Initialize,
    /// Flash storage reported itself initialized
    FlashReady,

    // Scheduler events
    /// A write, update or delete was submitted
    RequestIssued,
    /// The submitted request completed successfully
    RequestCompleted,
    /// The submitted request completed as busy and was re-queued
    Retry,
    /// No pending work is left
    Drained,

    // Capacity events
    /// Service request queue is full
    QueueFull,
    /// Flash region is full
    FlashFull,
    /// Garbage collection reclaimed space
    GarbageCollected,

    // Error events
    /// An operation failed with an unexpected result
    Failed(ErrorKind),
}
