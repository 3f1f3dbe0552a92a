//! Plugin action registry
//!
//! Custom per-trial or per-phase actions are registered under a name and
//! invoked through [`ActionInvoker`]. Three backends are supported:
//!
//! - script: an external program, parameters in `ARENA_PARAM_<NAME>`
//! - native: an in-process closure
//! - device: one templated line written to a TCP or serial device
//!
//! Each configuration is validated when it is registered, never at
//! dispatch time.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use arena_core::config::ParamMap;
use arena_core::traits::{ActionInvoker, ActionOutcome, PluginError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::transport::Endpoint;

/// Polling interval while waiting for a script to exit
const SCRIPT_POLL: Duration = Duration::from_millis(10);

/// Environment variable prefix for script parameters
pub const PARAM_ENV_PREFIX: &str = "ARENA_PARAM_";

fn default_timeout_ms() -> u64 {
    10_000
}

/// Run an external program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptAction {
    /// Program to execute
    pub program: String,
    /// Fixed arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the program after this long
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Send a command line to an external device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceAction {
    /// `HOST[:PORT]` or `serial:PATH[@BAUD]`
    pub endpoint: String,
    /// Line to send; `{name}` is replaced by the parameter `name`
    pub command_template: String,
    /// Required prefix of the reply line; no reply is awaited when absent
    #[serde(default)]
    pub expect: Option<String>,
    /// Connect and reply deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Plugin configuration as written in the run options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginSpec {
    Script(ScriptAction),
    Device(DeviceAction),
}

/// In-process action
pub type NativeAction = Box<dyn FnMut(&ParamMap) -> ActionOutcome + Send>;

enum Backend {
    Script(ScriptAction),
    Native(NativeAction),
    Device {
        action: DeviceAction,
        endpoint: Endpoint,
    },
}

impl Backend {
    fn kind(&self) -> &'static str {
        match self {
            Backend::Script(_) => "script",
            Backend::Native(_) => "native",
            Backend::Device { .. } => "device",
        }
    }
}

/// Named plugin actions
#[derive(Default)]
pub struct PluginRegistry {
    actions: BTreeMap<String, Backend>,
    dry_run: bool,
}

fn invalid(name: &str, reason: impl Into<String>) -> PluginError {
    PluginError::InvalidConfig {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn check_name(name: &str) -> Result<(), PluginError> {
    if name.trim().is_empty() {
        return Err(invalid(name, "name is empty"));
    }
    Ok(())
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured plugins
    pub fn from_specs(specs: &BTreeMap<String, PluginSpec>) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for (name, spec) in specs {
            registry.register(name, spec.clone())?;
        }
        Ok(registry)
    }

    /// Log external actions instead of running them
    ///
    /// Native actions still run.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Register a configured plugin
    pub fn register(&mut self, name: &str, spec: PluginSpec) -> Result<(), PluginError> {
        match spec {
            PluginSpec::Script(action) => self.register_script(name, action),
            PluginSpec::Device(action) => self.register_device(name, action),
        }
    }

    /// Register an external program
    pub fn register_script(&mut self, name: &str, action: ScriptAction) -> Result<(), PluginError> {
        check_name(name)?;
        if action.program.trim().is_empty() {
            return Err(invalid(name, "program is empty"));
        }
        if action.timeout_ms == 0 {
            return Err(invalid(name, "timeout_ms must be positive"));
        }
        self.insert(name, Backend::Script(action));
        Ok(())
    }

    /// Register a device command
    pub fn register_device(&mut self, name: &str, action: DeviceAction) -> Result<(), PluginError> {
        check_name(name)?;
        let endpoint = Endpoint::parse(&action.endpoint).map_err(|e| invalid(name, e))?;
        if endpoint == Endpoint::DryRun {
            return Err(invalid(name, "device endpoint cannot be dry-run"));
        }
        if action.command_template.trim().is_empty() {
            return Err(invalid(name, "command_template is empty"));
        }
        if action.timeout_ms == 0 {
            return Err(invalid(name, "timeout_ms must be positive"));
        }
        check_template(name, &action.command_template)?;
        self.insert(name, Backend::Device { action, endpoint });
        Ok(())
    }

    /// Register an in-process action
    pub fn register_native<F>(&mut self, name: &str, action: F) -> Result<(), PluginError>
    where
        F: FnMut(&ParamMap) -> ActionOutcome + Send + 'static,
    {
        check_name(name)?;
        self.insert(name, Backend::Native(Box::new(action)));
        Ok(())
    }

    fn insert(&mut self, name: &str, backend: Backend) {
        debug!("Registered {} plugin `{}`", backend.kind(), name);
        if self.actions.insert(name.to_string(), backend).is_some() {
            warn!("Plugin `{}` replaced an earlier registration", name);
        }
    }

    /// Registered action names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

impl ActionInvoker for PluginRegistry {
    fn invoke(&mut self, name: &str, params: &ParamMap) -> Result<ActionOutcome, PluginError> {
        let dry_run = self.dry_run;
        let backend = self
            .actions
            .get_mut(name)
            .ok_or_else(|| PluginError::Unknown(name.to_string()))?;

        match backend {
            Backend::Native(action) => Ok(action(params)),
            Backend::Script(action) if dry_run => {
                info!("dry-run: skipping script `{}` ({})", name, action.program);
                Ok(ActionOutcome::Success)
            }
            Backend::Device { action, .. } if dry_run => {
                info!("dry-run: skipping device `{}` ({})", name, action.endpoint);
                Ok(ActionOutcome::Success)
            }
            Backend::Script(action) => run_script(name, action, params),
            Backend::Device { action, endpoint } => run_device(name, action, endpoint, params),
        }
    }

    fn supports(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}

/// Environment variable name for a parameter
fn param_env_name(param: &str) -> String {
    let mut out = String::from(PARAM_ENV_PREFIX);
    out.extend(param.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    out
}

fn run_script(
    name: &str,
    action: &ScriptAction,
    params: &ParamMap,
) -> Result<ActionOutcome, PluginError> {
    let mut command = Command::new(&action.program);
    command
        .args(&action.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    for (key, value) in params {
        command.env(param_env_name(key), value.to_string());
    }

    let io_err = |source| PluginError::Io {
        name: name.to_string(),
        source,
    };
    let mut child = command.spawn().map_err(io_err)?;
    let deadline = Instant::now() + Duration::from_millis(action.timeout_ms);

    loop {
        if let Some(status) = child.try_wait().map_err(io_err)? {
            debug!("Script `{}` exited with {}", name, status);
            return Ok(if status.success() {
                ActionOutcome::Success
            } else {
                ActionOutcome::Failure(format!("`{}` exited with {}", action.program, status))
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PluginError::Timeout {
                name: name.to_string(),
                timeout_ms: action.timeout_ms,
            });
        }
        thread::sleep(SCRIPT_POLL);
    }
}

/// Piece of a command template
enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split a command template into literal text and placeholders
fn pieces(template: &str) -> Result<Vec<Piece<'_>>, String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| "unclosed `{` in command_template".to_string())?;
        let key = &after[..close];
        if key.is_empty() {
            return Err("empty `{}` in command_template".to_string());
        }
        out.push(Piece::Text(&rest[..open]));
        out.push(Piece::Placeholder(key));
        rest = &after[close + 1..];
    }
    out.push(Piece::Text(rest));
    Ok(out)
}

fn check_template(name: &str, template: &str) -> Result<(), PluginError> {
    pieces(template).map(|_| ()).map_err(|e| invalid(name, e))
}

/// Fill a command template from parameters
///
/// Substituted values are never scanned for placeholders.
fn render_template(template: &str, params: &ParamMap) -> Result<String, String> {
    let mut line = String::with_capacity(template.len());
    for piece in pieces(template)? {
        match piece {
            Piece::Text(text) => line.push_str(text),
            Piece::Placeholder(key) => {
                let value = params
                    .get(key)
                    .ok_or_else(|| format!("parameter `{}` is missing", key))?;
                let _ = write!(line, "{}", value);
            }
        }
    }
    Ok(line)
}

fn run_device(
    name: &str,
    action: &DeviceAction,
    endpoint: &Endpoint,
    params: &ParamMap,
) -> Result<ActionOutcome, PluginError> {
    let line = match render_template(&action.command_template, params) {
        Ok(line) => line,
        Err(reason) => return Ok(ActionOutcome::Failure(reason)),
    };
    let timeout = Duration::from_millis(action.timeout_ms);
    let io_err = |source| PluginError::Io {
        name: name.to_string(),
        source,
    };

    let mut transport = endpoint.connect(timeout).map_err(io_err)?;
    transport
        .write_all(format!("{}\n", line).as_bytes())
        .map_err(io_err)?;
    debug!("Device `{}` <- {:?}", name, line);

    let Some(expect) = &action.expect else {
        transport.shutdown();
        return Ok(ActionOutcome::Success);
    };

    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut buf = [0u8; 128];
    loop {
        if reply.contains(&b'\n') {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            transport.shutdown();
            return Err(PluginError::Timeout {
                name: name.to_string(),
                timeout_ms: action.timeout_ms,
            });
        }
        match transport.read(&mut buf, deadline - now) {
            Ok(0) => break,
            Ok(n) => reply.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(io_err(e)),
        }
    }
    transport.shutdown();

    let reply = String::from_utf8_lossy(&reply);
    let reply = reply.lines().next().unwrap_or("").trim_end();
    debug!("Device `{}` -> {:?}", name, reply);
    if reply.starts_with(expect.as_str()) {
        Ok(ActionOutcome::Success)
    } else {
        Ok(ActionOutcome::Failure(format!(
            "expected reply starting with {:?}, got {:?}",
            expect, reply
        )))
    }
}
