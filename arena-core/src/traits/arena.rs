//! Arena control trait

use std::io;
use std::time::Duration;

use arena_protocol::{TrialParams, WireError};
use thiserror::Error;

/// Errors from arena operations
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Operation needs an open link
    #[error("arena link is not open")]
    NotOpen,
    /// Could not reach the arena
    #[error("could not connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    /// Read or write failed mid-command
    #[error("{command}: transport error: {source}")]
    Transport {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    /// Peer closed the connection
    #[error("{command}: arena closed the connection")]
    Disconnected { command: &'static str },
    /// No response within the deadline
    #[error("{command}: no response after {waited:?}")]
    Timeout {
        command: &'static str,
        waited: Duration,
    },
    /// Arena answered with a negative acknowledgement
    #[error("{command}: arena rejected the command (status {status:#04x}: {message})")]
    Command {
        command: &'static str,
        status: u8,
        message: String,
    },
    /// Argument rejected before any I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Response could not be framed
    #[error("{command}: malformed response: {error}")]
    Malformed {
        command: &'static str,
        error: WireError,
    },
}

impl ArenaError {
    /// Check if the error closed the link
    ///
    /// Transport-class errors end the run; negative acknowledgements and
    /// argument errors do not.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ArenaError::Connection { .. }
                | ArenaError::Transport { .. }
                | ArenaError::Disconnected { .. }
                | ArenaError::Timeout { .. }
                | ArenaError::Malformed { .. }
                | ArenaError::NotOpen
        )
    }

    /// Command that failed, if known
    pub fn command(&self) -> Option<&'static str> {
        match self {
            ArenaError::Transport { command, .. }
            | ArenaError::Disconnected { command }
            | ArenaError::Timeout { command, .. }
            | ArenaError::Command { command, .. }
            | ArenaError::Malformed { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Display-control operations on one arena
///
/// Every operation except `open` and `close` requires an open link and
/// fails with [`ArenaError::NotOpen`] otherwise.
pub trait ArenaControl {
    /// Connect, optionally draining stale responses first
    fn open(&mut self, flush_responses: bool) -> Result<(), ArenaError>;

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Turn every pixel on
    fn all_on(&mut self) -> Result<(), ArenaError>;

    /// Turn every pixel off
    fn all_off(&mut self) -> Result<(), ArenaError>;

    /// Select 1- or 4-bit grayscale
    fn set_color_depth(&mut self, bits: u8) -> Result<(), ArenaError>;

    /// Start a pattern sequence
    ///
    /// Returns `Ok(false)` when the arena refuses the parameters or reports
    /// the sequence failed. With `wait_for_completion` the call blocks until
    /// the arena reports the sequence complete.
    fn trial_params(
        &mut self,
        params: &TrialParams,
        wait_for_completion: bool,
    ) -> Result<bool, ArenaError>;

    /// Send one encoded frame block
    fn stream_frame(&mut self, block: &[u8]) -> Result<(), ArenaError>;

    /// Abort whatever is displaying
    fn stop_display(&mut self) -> Result<(), ArenaError>;

    /// Release the connection; safe to call repeatedly
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let timeout = ArenaError::Timeout {
            command: "all_on",
            waited: Duration::from_millis(500),
        };
        assert!(timeout.is_transport());
        assert_eq!(timeout.command(), Some("all_on"));

        let dropped = ArenaError::Transport {
            command: "trial_params",
            source: io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        };
        assert!(dropped.is_transport());

        let nak = ArenaError::Command {
            command: "all_off",
            status: 1,
            message: "busy".into(),
        };
        assert!(!nak.is_transport());
        assert!(!ArenaError::InvalidArgument("bits".into()).is_transport());
    }

    #[test]
    fn test_error_messages() {
        let nak = ArenaError::Command {
            command: "set_color_depth",
            status: 2,
            message: "bad depth".into(),
        };
        assert_eq!(
            nak.to_string(),
            "set_color_depth: arena rejected the command (status 0x02: bad depth)"
        );
    }
}
