//! Seam traits
//!
//! These traits define the interface between the scheduling logic and
//! the arena connection, plugin backends and time source.

pub mod action;
pub mod arena;
pub mod clock;

pub use action::{ActionInvoker, ActionOutcome, NoPlugins, PluginError};
pub use arena::{ArenaControl, ArenaError};
pub use clock::{CancelToken, Cancelled, Clock, SimulatedClock, SystemClock};
