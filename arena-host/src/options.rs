//! Run options
//!
//! Options come from an optional TOML file and are overridden by command
//! line flags. They are flat; only plugin definitions nest.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::LinkConfig;
use crate::plugin::PluginSpec;
use crate::transport::{Endpoint, DEFAULT_BAUD_RATE};

/// Problems with run options
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid options file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no arena selected: set `host`, `serial_port` or `dry_run`")]
    NoEndpoint,
    #[error("`host` and `serial_port` are mutually exclusive")]
    ConflictingEndpoints,
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("`{0}` must be positive")]
    ZeroTimeout(&'static str),
    #[error("seed {0} does not fit the trial-order record")]
    SeedOutOfRange(u64),
}

/// Everything a run needs besides the protocol description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunOptions {
    /// Arena controller `HOST[:PORT]`
    pub host: Option<String>,
    /// Arena controller serial port
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    /// Parent of the per-run directories
    pub output_dir: PathBuf,
    /// `tracing` filter directive, e.g. `info` or `arena_host=debug`
    pub verbosity: String,
    /// Use the simulated arena and virtual time
    pub dry_run: bool,
    /// Fixed randomization seed, overrides the protocol's
    pub seed: Option<u64>,
    pub ack_timeout_ms: u64,
    pub completion_grace_ms: u64,
    /// Trial order from an earlier run to present verbatim
    pub replay: Option<PathBuf>,
    /// Drain stale responses when the link opens
    pub flush_responses: bool,
    /// Named plugin actions
    pub plugins: BTreeMap<String, PluginSpec>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            host: None,
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            output_dir: PathBuf::from("runs"),
            verbosity: "info".to_string(),
            dry_run: false,
            seed: None,
            ack_timeout_ms: 1000,
            completion_grace_ms: 2000,
            replay: None,
            flush_responses: true,
            plugins: BTreeMap::new(),
        }
    }
}

impl RunOptions {
    /// Parse a TOML options document
    pub fn from_toml_str(input: &str) -> Result<Self, OptionsError> {
        Ok(toml::from_str(input)?)
    }

    /// Load a TOML options file
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let text = fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check values that parse but cannot work
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.ack_timeout_ms == 0 {
            return Err(OptionsError::ZeroTimeout("ack_timeout_ms"));
        }
        if let Some(seed) = self.seed {
            if seed > i64::MAX as u64 {
                return Err(OptionsError::SeedOutOfRange(seed));
            }
        }
        self.endpoint().map(|_| ())
    }

    /// Arena endpoint selected by these options
    pub fn endpoint(&self) -> Result<Endpoint, OptionsError> {
        if self.dry_run {
            return Ok(Endpoint::DryRun);
        }
        match (&self.host, &self.serial_port) {
            (Some(_), Some(_)) => Err(OptionsError::ConflictingEndpoints),
            (Some(host), None) => Endpoint::tcp(host.trim()).map_err(OptionsError::InvalidHost),
            (None, Some(path)) => Ok(Endpoint::Serial {
                path: path.clone(),
                baud_rate: self.baud_rate,
            }),
            (None, None) => Err(OptionsError::NoEndpoint),
        }
    }

    /// Link timing from these options
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            completion_grace: Duration::from_millis(self.completion_grace_ms),
            ..LinkConfig::default()
        }
    }
}

/// Run a trial protocol on an LED arena
#[derive(Debug, Parser)]
#[command(name = "arena-run", version, about, long_about = None)]
pub struct Cli {
    /// Protocol description (TOML)
    pub protocol: PathBuf,

    /// Options file (TOML); flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Arena controller HOST[:PORT]
    #[arg(long)]
    pub host: Option<String>,

    /// Arena controller serial port
    #[arg(long)]
    pub serial_port: Option<String>,

    #[arg(long)]
    pub baud_rate: Option<u32>,

    /// Parent directory for run artifacts
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a tracing directive)
    #[arg(short, long)]
    pub verbosity: Option<String>,

    /// Simulate the arena instead of connecting
    #[arg(long)]
    pub dry_run: bool,

    /// Randomization seed
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    #[arg(long)]
    pub completion_grace_ms: Option<u64>,

    /// Present the trial order recorded by an earlier run
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Keep stale responses buffered on connect
    #[arg(long)]
    pub no_flush: bool,
}

impl Cli {
    /// Merge flags over the options file (or defaults)
    pub fn options(&self) -> Result<RunOptions, OptionsError> {
        let mut options = match &self.config {
            Some(path) => RunOptions::load(path)?,
            None => RunOptions::default(),
        };

        if let Some(host) = &self.host {
            options.host = Some(host.clone());
        }
        if let Some(port) = &self.serial_port {
            options.serial_port = Some(port.clone());
        }
        if let Some(baud) = self.baud_rate {
            options.baud_rate = baud;
        }
        if let Some(dir) = &self.output_dir {
            options.output_dir = dir.clone();
        }
        if let Some(verbosity) = &self.verbosity {
            options.verbosity = verbosity.clone();
        }
        if self.dry_run {
            options.dry_run = true;
        }
        if self.seed.is_some() {
            options.seed = self.seed;
        }
        if let Some(ms) = self.ack_timeout_ms {
            options.ack_timeout_ms = ms;
        }
        if let Some(ms) = self.completion_grace_ms {
            options.completion_grace_ms = ms;
        }
        if let Some(path) = &self.replay {
            options.replay = Some(path.clone());
        }
        if self.no_flush {
            options.flush_responses = false;
        }

        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RunOptions::from_toml_str("").unwrap();
        assert_eq!(options, RunOptions::default());
        assert!(options.flush_responses);
        assert!(matches!(options.validate(), Err(OptionsError::NoEndpoint)));
    }

    #[test]
    fn test_options_file() {
        let options = RunOptions::from_toml_str(
            r#"
            host = "192.168.10.62"
            output_dir = "/data/arena"
            verbosity = "debug"
            seed = 99
            ack_timeout_ms = 250

            [plugins.reward]
            kind = "script"
            program = "reward.sh"
            "#,
        )
        .unwrap();
        options.validate().unwrap();

        assert_eq!(
            options.endpoint().unwrap(),
            Endpoint::Tcp {
                host: "192.168.10.62".into(),
                port: 62222
            }
        );
        assert_eq!(options.link_config().ack_timeout, Duration::from_millis(250));
        assert_eq!(options.plugins.len(), 1);
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(matches!(
            RunOptions::from_toml_str("hots = \"x\""),
            Err(OptionsError::Parse(_))
        ));
    }

    #[test]
    fn test_endpoint_selection() {
        let mut options = RunOptions {
            serial_port: Some("/dev/ttyACM0".into()),
            baud_rate: 57600,
            ..RunOptions::default()
        };
        assert_eq!(
            options.endpoint().unwrap(),
            Endpoint::Serial {
                path: "/dev/ttyACM0".into(),
                baud_rate: 57600
            }
        );

        options.host = Some("arena".into());
        assert!(matches!(
            options.endpoint(),
            Err(OptionsError::ConflictingEndpoints)
        ));

        options.dry_run = true;
        assert_eq!(options.endpoint().unwrap(), Endpoint::DryRun);
    }

    #[test]
    fn test_seed_range() {
        let options = RunOptions {
            dry_run: true,
            seed: Some(u64::MAX),
            ..RunOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(OptionsError::SeedOutOfRange(_))
        ));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        fs::write(&path, "host = \"arena-a\"\nseed = 1\nverbosity = \"warn\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "arena-run",
            "protocol.toml",
            "--config",
            path.to_str().unwrap(),
            "--seed",
            "7",
            "--no-flush",
            "-v",
            "debug",
        ])
        .unwrap();
        let options = cli.options().unwrap();

        assert_eq!(options.host.as_deref(), Some("arena-a"));
        assert_eq!(options.seed, Some(7));
        assert_eq!(options.verbosity, "debug");
        assert!(!options.flush_responses);
        assert_eq!(cli.protocol, PathBuf::from("protocol.toml"));
    }

    #[test]
    fn test_dry_run_flag_needs_no_file() {
        let cli = Cli::try_parse_from(["arena-run", "p.toml", "--dry-run"]).unwrap();
        let options = cli.options().unwrap();
        assert_eq!(options.endpoint().unwrap(), Endpoint::DryRun);
    }
}
