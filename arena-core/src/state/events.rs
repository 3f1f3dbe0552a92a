//! Events that trigger phase transitions

use super::machine::FailureKind;

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle events
    /// Run started
    Start,
    /// Pretrial actions and wait finished
    PretrialComplete,

    // Block events
    /// Current trial was sent (successfully or not)
    TrialDispatched,
    /// Intertrial wait finished, more trials remain
    IntertrialComplete,
    /// No trials remain
    BlockComplete,

    // Posttrial events
    /// Posttrial actions and wait finished
    PosttrialComplete,

    // Failure events
    /// Unrecoverable error detected
    Fault(FailureKind),
    /// Operator abort
    Abort,
    /// Best-effort hardware shutdown finished
    CleanupComplete,
}

impl Event {
    /// Check if this event comes from trial sequencing
    pub fn is_block_event(&self) -> bool {
        matches!(
            self,
            Event::TrialDispatched | Event::IntertrialComplete | Event::BlockComplete
        )
    }

    /// Check if this event ends the run early
    pub fn is_failure_event(&self) -> bool {
        matches!(self, Event::Fault(_) | Event::Abort)
    }
}
