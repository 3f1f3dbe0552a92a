//! Diagnostic logging setup
//!
//! `RUST_LOG` wins over the configured verbosity when set.

use std::io::IsTerminal;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors configuring the global subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid verbosity `{0}`")]
    InvalidFilter(String),
    #[error("logging is already initialised")]
    AlreadyInitialised,
}

/// Filter for a verbosity directive
pub fn filter_for(verbosity: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = match verbosity.trim() {
        "" => "info",
        "quiet" => "error",
        other => other,
    };
    EnvFilter::try_new(directive).map_err(|_| LoggingError::InvalidFilter(verbosity.to_string()))
}

/// Install the global `tracing` subscriber
pub fn init_logging(verbosity: &str) -> Result<(), LoggingError> {
    let filter = filter_for(verbosity)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialised)
}
