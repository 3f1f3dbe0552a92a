//! Run directory and end-of-run artifacts
//!
//! ```text
//! <output_dir>/<YYYYmmdd_HHMMSS>_<name>/
//!     run.log
//!     trial_order.toml
//!     summary.txt
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use arena_core::scheduler::{RunSummary, TrialOrder};
use chrono::{DateTime, Local};
use tracing::debug;

use crate::error::RunError;

pub const RUN_LOG_FILE: &str = "run.log";
pub const TRIAL_ORDER_FILE: &str = "trial_order.toml";
pub const SUMMARY_FILE: &str = "summary.txt";

/// Directory holding one run's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    path: PathBuf,
}

/// Keep names filesystem-safe
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

impl RunDirectory {
    /// Create a fresh run directory under `output_dir`
    ///
    /// A numeric suffix is added if a run with the same name started in
    /// the same second.
    pub fn create(
        output_dir: &Path,
        name: &str,
        started: DateTime<Local>,
    ) -> Result<Self, RunError> {
        fs::create_dir_all(output_dir).map_err(|e| RunError::artifact(output_dir, e))?;

        let base = format!("{}_{}", started.format("%Y%m%d_%H%M%S"), sanitize(name));
        let mut candidate = output_dir.join(&base);
        let mut suffix = 2;
        loop {
            match fs::create_dir(&candidate) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    candidate = output_dir.join(format!("{}_{}", base, suffix));
                    suffix += 1;
                }
                Err(e) => return Err(RunError::artifact(candidate, e)),
            }
        }
        debug!("Run directory {}", candidate.display());
        Ok(Self { path: candidate })
    }

    /// Use an existing directory
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> PathBuf {
        self.path.join(RUN_LOG_FILE)
    }

    pub fn trial_order_path(&self) -> PathBuf {
        self.path.join(TRIAL_ORDER_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.path.join(SUMMARY_FILE)
    }

    /// Persist the trial order verbatim
    pub fn write_trial_order(&self, order: &TrialOrder) -> Result<PathBuf, RunError> {
        let path = self.trial_order_path();
        let text = order.to_toml_string()?;
        fs::write(&path, text).map_err(|e| RunError::artifact(&path, e))?;
        Ok(path)
    }

    /// Write the human-readable summary
    pub fn write_summary(
        &self,
        summary: &RunSummary,
        started: DateTime<Local>,
        finished: DateTime<Local>,
    ) -> Result<PathBuf, RunError> {
        let path = self.summary_path();
        let text = format!(
            "started:          {}\nfinished:         {}\n{}",
            started.format("%Y-%m-%d %H:%M:%S"),
            finished.format("%Y-%m-%d %H:%M:%S"),
            summary
        );
        fs::write(&path, text).map_err(|e| RunError::artifact(&path, e))?;
        Ok(path)
    }
}

/// Load a trial order written by an earlier run
pub fn load_trial_order(path: &Path) -> Result<TrialOrder, RunError> {
    let text = fs::read_to_string(path).map_err(|e| RunError::artifact(path, e))?;
    Ok(TrialOrder::from_toml_str(&text)?)
}
