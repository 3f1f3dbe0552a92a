//! Host side of the LED arena controller
//!
//! - Transports (TCP, serial and a simulated arena for dry runs)
//! - [`ArenaLink`], the command/acknowledge client for one arena
//! - Plugin actions (scripts, line-oriented devices, native closures)
//! - [`TrialScheduler`], which runs a protocol and writes its artifacts
//! - Run options, command line and logging setup for `arena-run`

#![deny(unsafe_code)]

pub mod artifacts;
pub mod error;
pub mod link;
pub mod logging;
pub mod options;
pub mod plugin;
pub mod runlog;
pub mod runner;
pub mod transport;

pub use artifacts::{load_trial_order, RunDirectory};
pub use error::RunError;
pub use link::{ArenaLink, LinkConfig};
pub use options::{Cli, OptionsError, RunOptions};
pub use plugin::{PluginRegistry, PluginSpec};
pub use runner::{RunReport, SchedulerOptions, TrialScheduler};
pub use transport::Endpoint;
