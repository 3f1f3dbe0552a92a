//! Phase state machine definition
//!
//! Every arena command the scheduler issues is a function of the current
//! phase and an event.

use serde::{Deserialize, Serialize};

use super::events::Event;

/// Experiment phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Run created, nothing sent to the arena yet
    Idle,
    /// Pretrial actions and wait
    Pretrial,
    /// Dispatching the next trial
    Block,
    /// Waiting between trials
    Intertrial,
    /// Posttrial actions and wait
    Posttrial,
    /// Fatal error or abort; best-effort hardware shutdown in progress
    Cleanup(FailureKind),
    /// All phases finished successfully
    Done,
    /// Run ended on a fatal error
    Failed(FailureKind),
}

/// Reasons a run can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Protocol description rejected before any I/O
    InvalidProtocol,
    /// Connection lost or acknowledgement timed out
    Transport,
    /// Operator abort
    Cancelled,
}

impl State {
    /// Check if the arena may be sent display commands in this state
    pub fn display_allowed(&self) -> bool {
        matches!(
            self,
            State::Pretrial | State::Block | State::Intertrial | State::Posttrial
        )
    }

    /// Check if this is a failure state (including cleanup)
    pub fn is_failure(&self) -> bool {
        matches!(self, State::Cleanup(_) | State::Failed(_))
    }

    /// Check if the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed(_))
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::Pretrial => "pretrial",
            State::Block => "block",
            State::Intertrial => "intertrial",
            State::Posttrial => "posttrial",
            State::Cleanup(_) => "cleanup",
            State::Done => "done",
            State::Failed(_) => "failed",
        }
    }

    /// Process an event and return the next state
    pub fn transition(self, event: Event) -> Self {
        use Event::*;
        use State::*;

        match (self, event) {
            // Idle transitions
            (Idle, Start) => Pretrial,
            (Idle, Fault(kind)) => Failed(kind),
            (Idle, Abort) => Failed(FailureKind::Cancelled),

            // Pretrial transitions
            (Pretrial, PretrialComplete) => Block,

            // Block transitions
            (Block, TrialDispatched) => Intertrial,
            (Block, BlockComplete) => Posttrial,

            // Intertrial transitions
            (Intertrial, IntertrialComplete) => Block,
            (Intertrial, BlockComplete) => Posttrial,

            // Posttrial transitions
            (Posttrial, PosttrialComplete) => Done,

            // Faults from any active phase go through cleanup
            (Pretrial | Block | Intertrial | Posttrial, Fault(kind)) => Cleanup(kind),
            (Pretrial | Block | Intertrial | Posttrial, Abort) => {
                Cleanup(FailureKind::Cancelled)
            }

            // Cleanup transitions
            (Cleanup(kind), CleanupComplete) => Failed(kind),

            // Default: stay in current state
            _ => self,
        }
    }
}
