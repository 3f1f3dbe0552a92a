//! Plugin action capability

use thiserror::Error;

use crate::config::ParamMap;

/// Result of a plugin action that ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Action reported success
    Success,
    /// Action ran and reported failure
    Failure(String),
}

impl ActionOutcome {
    /// Check for success
    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Success)
    }
}

/// Errors raised before or while invoking a plugin
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin registered under this name
    #[error("no plugin registered for action `{0}`")]
    Unknown(String),
    /// Plugin configuration failed validation
    #[error("plugin `{name}` is misconfigured: {reason}")]
    InvalidConfig { name: String, reason: String },
    /// Plugin could not be run
    #[error("plugin `{name}` failed to run: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// Plugin did not finish in time
    #[error("plugin `{name}` timed out after {timeout_ms} ms")]
    Timeout { name: String, timeout_ms: u64 },
}

/// Invokes named custom actions with their parameters
pub trait ActionInvoker {
    /// Run an action to completion
    fn invoke(&mut self, name: &str, params: &ParamMap) -> Result<ActionOutcome, PluginError>;

    /// Check if an action name can be invoked
    fn supports(&self, name: &str) -> bool;
}

/// Invoker with nothing registered
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlugins;

impl ActionInvoker for NoPlugins {
    fn invoke(&mut self, name: &str, _params: &ParamMap) -> Result<ActionOutcome, PluginError> {
        Err(PluginError::Unknown(name.to_string()))
    }

    fn supports(&self, _name: &str) -> bool {
        false
    }
}
