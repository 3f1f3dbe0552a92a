//! Trial scheduler core
//!
//! Expands a block into a trial order and sequences the phases of a run.
//! The host's run loop performs the I/O each phase calls for.

pub mod sequencer;
pub mod summary;
pub mod trials;

pub use sequencer::{Sequencer, TrialOutcome, TrialStatus};
pub use summary::RunSummary;
pub use trials::{build_trial_order, fresh_seed, TrialOrder, TrialRecord};
