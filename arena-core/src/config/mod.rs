//! Experiment configuration
//!
//! Protocol descriptions are parsed from TOML and validated before any
//! hardware I/O takes place.

pub mod types;
pub mod validate;

pub use types::*;
pub use validate::ProtocolError;
