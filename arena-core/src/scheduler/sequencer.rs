//! Run sequencer
//!
//! Tracks the phase and the position in the trial order, and turns
//! phase completions into state machine events. Performs no I/O; the
//! host's run loop executes whatever the current phase calls for.

use tracing::debug;

use super::trials::{TrialOrder, TrialRecord};
use crate::state::{Event, FailureKind, State};

/// How a trial dispatch ended
#[derive(Debug, Clone, PartialEq)]
pub enum TrialStatus {
    /// Arena reported the sequence complete, or the plugin succeeded
    Completed,
    /// Accepted without waiting for completion
    Dispatched,
    /// Arena refused the parameters or reported a failed sequence
    Rejected,
    /// Command or plugin error; the run continued
    Failed(String),
}

impl TrialStatus {
    /// Check if the trial counts as presented
    pub fn is_success(&self) -> bool {
        matches!(self, TrialStatus::Completed | TrialStatus::Dispatched)
    }
}

/// Result of one trial
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    /// Position in the trial order
    pub index: usize,
    /// Condition presented
    pub condition_id: u32,
    /// How the dispatch ended
    pub status: TrialStatus,
}

/// Phase sequencer for one run
#[derive(Debug)]
pub struct Sequencer {
    state: State,
    order: TrialOrder,
    cursor: usize,
    intertrial_after_last: bool,
    outcomes: Vec<TrialOutcome>,
}

impl Sequencer {
    /// Create a sequencer for a resolved trial order
    pub fn new(order: TrialOrder, intertrial_after_last: bool) -> Self {
        Self {
            state: State::Idle,
            order,
            cursor: 0,
            intertrial_after_last,
            outcomes: Vec::new(),
        }
    }

    /// Current phase
    pub fn state(&self) -> State {
        self.state
    }

    /// Trial order being executed
    pub fn order(&self) -> &TrialOrder {
        &self.order
    }

    /// Outcomes recorded so far
    pub fn outcomes(&self) -> &[TrialOutcome] {
        &self.outcomes
    }

    /// Trials not yet dispatched
    pub fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }

    fn apply(&mut self, event: Event) -> State {
        let next = self.state.transition(event);
        if next != self.state {
            debug!(
                "phase {} -> {} on {:?}",
                self.state.name(),
                next.name(),
                event
            );
        }
        self.state = next;
        next
    }

    /// Enter the pretrial phase
    pub fn start(&mut self) -> State {
        self.apply(Event::Start)
    }

    /// Pretrial actions and wait finished
    pub fn finish_pretrial(&mut self) -> State {
        self.apply(Event::PretrialComplete)
    }

    /// Trial to dispatch, if the block phase is active
    pub fn next_trial(&self) -> Option<&TrialRecord> {
        if self.state == State::Block {
            self.order.trials.get(self.cursor)
        } else {
            None
        }
    }

    /// Record the current trial's outcome and advance
    ///
    /// Goes to the intertrial phase, or straight to posttrial after the
    /// last trial when the intertrial is not repeated there.
    pub fn record_trial(&mut self, status: TrialStatus) -> State {
        let Some(trial) = self.next_trial() else {
            return self.state;
        };
        let outcome = TrialOutcome {
            index: trial.index,
            condition_id: trial.condition_id,
            status,
        };
        self.outcomes.push(outcome);
        self.cursor += 1;

        if self.remaining() == 0 && !self.intertrial_after_last {
            self.apply(Event::BlockComplete)
        } else {
            self.apply(Event::TrialDispatched)
        }
    }

    /// Intertrial actions and wait finished
    pub fn finish_intertrial(&mut self) -> State {
        if self.remaining() == 0 {
            self.apply(Event::BlockComplete)
        } else {
            self.apply(Event::IntertrialComplete)
        }
    }

    /// Posttrial actions and wait finished
    pub fn finish_posttrial(&mut self) -> State {
        self.apply(Event::PosttrialComplete)
    }

    /// Unrecoverable error
    pub fn fault(&mut self, kind: FailureKind) -> State {
        self.apply(Event::Fault(kind))
    }

    /// Operator abort
    pub fn abort(&mut self) -> State {
        self.apply(Event::Abort)
    }

    /// Best-effort shutdown finished
    pub fn finish_cleanup(&mut self) -> State {
        self.apply(Event::CleanupComplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RandomizeMode;

    fn make_order(n: usize) -> TrialOrder {
        TrialOrder {
            randomize: RandomizeMode::None,
            seed: None,
            trials: (0..n)
                .map(|i| TrialRecord {
                    index: i,
                    condition_id: i as u32 + 1,
                    pattern_id: 1,
                    duration_s: 1.0,
                    repetition: 0,
                    repeat: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_full_run_with_intertrial_after_last() {
        let mut seq = Sequencer::new(make_order(2), true);
        assert_eq!(seq.state(), State::Idle);
        assert!(seq.next_trial().is_none());

        assert_eq!(seq.start(), State::Pretrial);
        assert_eq!(seq.finish_pretrial(), State::Block);

        assert_eq!(seq.next_trial().map(|t| t.index), Some(0));
        assert_eq!(seq.record_trial(TrialStatus::Completed), State::Intertrial);
        assert_eq!(seq.finish_intertrial(), State::Block);

        assert_eq!(seq.next_trial().map(|t| t.index), Some(1));
        assert_eq!(seq.record_trial(TrialStatus::Rejected), State::Intertrial);
        assert_eq!(seq.finish_intertrial(), State::Posttrial);
        assert_eq!(seq.finish_posttrial(), State::Done);

        assert_eq!(seq.outcomes().len(), 2);
        assert_eq!(seq.outcomes()[1].status, TrialStatus::Rejected);
        assert_eq!(seq.remaining(), 0);
    }

    #[test]
    fn test_last_trial_skips_intertrial() {
        let mut seq = Sequencer::new(make_order(2), false);
        seq.start();
        seq.finish_pretrial();

        assert_eq!(seq.record_trial(TrialStatus::Completed), State::Intertrial);
        assert_eq!(seq.finish_intertrial(), State::Block);
        assert_eq!(seq.record_trial(TrialStatus::Completed), State::Posttrial);
    }

    #[test]
    fn test_record_outside_block_ignored() {
        let mut seq = Sequencer::new(make_order(1), true);
        seq.start();
        assert_eq!(seq.record_trial(TrialStatus::Completed), State::Pretrial);
        assert!(seq.outcomes().is_empty());
        assert_eq!(seq.remaining(), 1);
    }

    #[test]
    fn test_fault_mid_block() {
        let mut seq = Sequencer::new(make_order(3), true);
        seq.start();
        seq.finish_pretrial();
        seq.record_trial(TrialStatus::Completed);
        seq.finish_intertrial();

        assert_eq!(
            seq.fault(FailureKind::Transport),
            State::Cleanup(FailureKind::Transport)
        );
        assert!(seq.next_trial().is_none());
        assert_eq!(seq.finish_cleanup(), State::Failed(FailureKind::Transport));
        assert_eq!(seq.remaining(), 2);
    }

    #[test]
    fn test_abort_is_cancelled() {
        let mut seq = Sequencer::new(make_order(1), true);
        seq.start();
        assert_eq!(seq.abort(), State::Cleanup(FailureKind::Cancelled));
        assert_eq!(seq.finish_cleanup(), State::Failed(FailureKind::Cancelled));
    }

    #[test]
    fn test_trial_status_success() {
        assert!(TrialStatus::Completed.is_success());
        assert!(TrialStatus::Dispatched.is_success());
        assert!(!TrialStatus::Rejected.is_success());
        assert!(!TrialStatus::Failed("nak".into()).is_success());
    }
}
