//! Transport-agnostic core logic for the arena trial scheduler
//!
//! This crate contains all experiment logic that does not depend on a
//! specific connection or plugin backend:
//!
//! - Protocol description types and validation
//! - Phase state machine
//! - Trial order expansion and randomization
//! - Run sequencer and summary
//! - Seam traits (arena control, plugin actions, clock)

#![deny(unsafe_code)]

pub mod config;
pub mod scheduler;
pub mod state;
pub mod traits;
