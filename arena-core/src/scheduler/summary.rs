//! Human-readable run summary

use std::fmt;
use std::time::Duration;

use super::sequencer::{TrialOutcome, TrialStatus};
use super::trials::TrialOrder;
use crate::config::RandomizeMode;
use crate::state::State;

/// Counters accumulated over a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Experiment name
    pub name: String,
    /// Ordering policy
    pub randomize: RandomizeMode,
    /// Seed actually used
    pub seed: Option<u64>,
    /// Trials in the order
    pub planned: usize,
    /// Trials confirmed complete
    pub completed: usize,
    /// Trials accepted without completion wait
    pub dispatched: usize,
    /// Trials refused or reported failed by the arena
    pub rejected: usize,
    /// Trials that hit a command or plugin error
    pub failed: usize,
    /// Phase actions that failed without ending the run
    pub action_failures: usize,
    /// Final phase
    pub final_state: State,
    /// Fatal error, if any
    pub failure: Option<String>,
    /// Wall time from start to end
    pub elapsed: Duration,
}

impl RunSummary {
    /// Start a summary for a trial order
    pub fn new(name: &str, order: &TrialOrder) -> Self {
        Self {
            name: name.to_string(),
            randomize: order.randomize,
            seed: order.seed,
            planned: order.len(),
            completed: 0,
            dispatched: 0,
            rejected: 0,
            failed: 0,
            action_failures: 0,
            final_state: State::Idle,
            failure: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Count a trial outcome
    pub fn record_trial(&mut self, outcome: &TrialOutcome) {
        match outcome.status {
            TrialStatus::Completed => self.completed += 1,
            TrialStatus::Dispatched => self.dispatched += 1,
            TrialStatus::Rejected => self.rejected += 1,
            TrialStatus::Failed(_) => self.failed += 1,
        }
    }

    /// Count a failed phase action
    pub fn record_action_failure(&mut self) {
        self.action_failures += 1;
    }

    /// Trials that were dispatched in any way
    pub fn attempted(&self) -> usize {
        self.completed + self.dispatched + self.rejected + self.failed
    }

    /// Trials never reached
    pub fn skipped(&self) -> usize {
        self.planned.saturating_sub(self.attempted())
    }

    /// Freeze the summary at run end
    pub fn finish(&mut self, state: State, elapsed: Duration, failure: Option<String>) {
        self.final_state = state;
        self.elapsed = elapsed;
        self.failure = failure;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "experiment:       {}", self.name)?;
        writeln!(f, "result:           {}", self.final_state.name())?;
        if let Some(failure) = &self.failure {
            writeln!(f, "failure:          {}", failure)?;
        }
        writeln!(f, "randomize:        {:?}", self.randomize)?;
        match self.seed {
            Some(seed) => writeln!(f, "seed:             {}", seed)?,
            None => writeln!(f, "seed:             none")?,
        }
        writeln!(f, "trials planned:   {}", self.planned)?;
        writeln!(f, "  completed:      {}", self.completed)?;
        writeln!(f, "  dispatched:     {}", self.dispatched)?;
        writeln!(f, "  rejected:       {}", self.rejected)?;
        writeln!(f, "  failed:         {}", self.failed)?;
        writeln!(f, "  skipped:        {}", self.skipped())?;
        writeln!(f, "action failures:  {}", self.action_failures)?;
        writeln!(f, "elapsed:          {:.3} s", self.elapsed.as_secs_f64())
    }
}
