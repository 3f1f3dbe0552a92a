//! Phase state machine for experiment runs
//!
//! Defines the authoritative order of phases in a run.
//! The state machine is explicit, finite, and deterministic.

pub mod events;
pub mod machine;

pub use events::Event;
pub use machine::{FailureKind, State};
