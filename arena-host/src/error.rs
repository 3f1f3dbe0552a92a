//! Run-level errors

use std::io;
use std::path::PathBuf;

use arena_core::config::ProtocolError;
use arena_core::state::FailureKind;
use arena_core::traits::ArenaError;
use thiserror::Error;

/// Why a run ended early
#[derive(Debug, Error)]
pub enum RunError {
    /// Protocol rejected before any hardware I/O
    #[error("invalid protocol: {0}")]
    Protocol(#[from] ProtocolError),
    /// Transport-class arena failure
    #[error("{}`{command}` failed: {source}", trial_prefix(.trial))]
    Arena {
        trial: Option<usize>,
        command: &'static str,
        #[source]
        source: ArenaError,
    },
    /// Operator abort
    #[error("run cancelled during {phase}")]
    Cancelled { phase: &'static str },
    /// Run directory or artifact could not be written
    #[error("could not write {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Trial order could not be serialized
    #[error("trial order could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn trial_prefix(trial: &Option<usize>) -> String {
    match trial {
        Some(index) => format!("trial {}: ", index),
        None => String::new(),
    }
}

impl RunError {
    /// Failure class for the state machine
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RunError::Protocol(_) => FailureKind::InvalidProtocol,
            RunError::Cancelled { .. } => FailureKind::Cancelled,
            RunError::Arena { .. } | RunError::Artifact { .. } | RunError::Serialize(_) => {
                FailureKind::Transport
            }
        }
    }

    pub(crate) fn artifact(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RunError::Artifact {
            path: path.into(),
            source,
        }
    }
}
