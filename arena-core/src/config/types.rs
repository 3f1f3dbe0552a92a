//! Protocol description types
//!
//! These types describe one experiment: arena settings, the four phases and
//! the block's conditions. They are usually loaded from TOML.

use std::collections::BTreeMap;
use std::fmt;

use arena_protocol::{encode_rows, EncodeError, FrameBlock, TrialParams};
use serde::{Deserialize, Serialize};

/// Protocol description format version understood by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Longest display duration the wire format can carry (100 ms units in a u16)
pub const MAX_DISPLAY_DURATION_S: f64 = u16::MAX as f64 / 10.0;

/// A single plugin parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// Named plugin parameters
pub type ParamMap = BTreeMap<String, ParamValue>;

/// Arena-wide settings applied at run start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArenaSettings {
    /// Color depth to select before the pretrial phase (1 or 4 bits)
    #[serde(default)]
    pub color_depth: Option<u8>,
}

/// How to display a resident pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySpec {
    /// Pattern identifier on the arena
    pub pattern_id: u16,
    /// How long the pattern is shown
    pub duration_s: f64,
    /// Frames per second
    #[serde(default)]
    pub frame_rate: i16,
    /// Grayscale level; falls back to the arena depth, then 4 bits
    #[serde(default)]
    pub gs_level: Option<u8>,
    /// Sequence repeats
    #[serde(default)]
    pub repeat_count: u16,
    /// First frame shown
    #[serde(default)]
    pub start_frame: u16,
    /// Block until the arena reports the sequence complete
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
}

impl DisplaySpec {
    /// Duration in the arena's 100 ms units
    pub fn duration_units(&self) -> u16 {
        (self.duration_s * 10.0).round().clamp(0.0, u16::MAX as f64) as u16
    }

    /// Build trial parameters for the wire
    pub fn to_trial_params(&self, default_gs: u8) -> TrialParams {
        TrialParams {
            gs_level: self.gs_level.unwrap_or(default_gs),
            pattern_id: self.pattern_id,
            frame_rate: self.frame_rate,
            repeat_count: self.repeat_count,
            start_frame: self.start_frame,
            duration_units: self.duration_units(),
        }
    }
}

/// A 20x20 image streamed to one panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSpec {
    /// Panel address in the frame header
    #[serde(default)]
    pub panel: u8,
    /// Bits per pixel (1 or 4)
    pub depth: u8,
    /// Pixel values, top row first
    pub rows: Vec<Vec<u8>>,
}

impl FrameSpec {
    /// Encode into a frame block ready for streaming
    pub fn encode(&self) -> Result<FrameBlock, EncodeError> {
        encode_rows(&self.rows, self.panel, self.depth)
    }
}

/// An action executed during a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Turn every pixel on
    AllOn,
    /// Turn every pixel off
    AllOff,
    /// Abort whatever the arena is displaying
    StopDisplay,
    /// Select a grayscale depth
    SetColorDepth { bits: u8 },
    /// Display a resident pattern
    Pattern(DisplaySpec),
    /// Stream one frame straight to a panel
    Frame(FrameSpec),
    /// Invoke a registered plugin action
    Plugin {
        name: String,
        #[serde(default)]
        params: ParamMap,
    },
}

impl ActionSpec {
    /// Short name for logs
    pub fn label(&self) -> &str {
        match self {
            ActionSpec::AllOn => "all_on",
            ActionSpec::AllOff => "all_off",
            ActionSpec::StopDisplay => "stop_display",
            ActionSpec::SetColorDepth { .. } => "set_color_depth",
            ActionSpec::Pattern(_) => "pattern",
            ActionSpec::Frame(_) => "frame",
            ActionSpec::Plugin { name, .. } => name,
        }
    }
}

/// Pretrial or posttrial phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseConfig {
    /// Wait after the actions, in seconds
    #[serde(default)]
    pub duration_s: f64,
    /// Actions run in order on phase entry
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Intertrial phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntertrialConfig {
    /// Wait between trials, in seconds
    #[serde(default)]
    pub duration_s: f64,
    /// Actions run at the start of every intertrial
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    /// Also run the intertrial after the final trial
    #[serde(default = "default_true")]
    pub after_last: bool,
}

impl Default for IntertrialConfig {
    fn default() -> Self {
        Self {
            duration_s: 0.0,
            actions: Vec::new(),
            after_last: true,
        }
    }
}

/// Trial ordering policy for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomizeMode {
    /// Conditions in declaration order, repetition after repetition
    None,
    /// One permutation over the whole block
    #[default]
    Full,
    /// Every repetition shows each condition once, in its own order
    PerRepetition,
}

/// One experimental condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition identifier, unique within the block
    pub id: u32,
    /// Pattern display parameters
    #[serde(flatten)]
    pub display: DisplaySpec,
    /// Plugin action run instead of the pattern command
    #[serde(default)]
    pub action: Option<String>,
    /// Parameters for the plugin action
    #[serde(default)]
    pub params: ParamMap,
    /// Frame streamed instead of the pattern command; `pattern_id` still
    /// labels the stimulus in the trial log
    #[serde(default)]
    pub frame: Option<FrameSpec>,
    /// Keys no other field claimed, rejected by validation
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Block phase: conditions × repetitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    /// Times each condition is presented
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    /// Ordering policy
    #[serde(default)]
    pub randomize: RandomizeMode,
    /// Fixed seed; a fresh one is drawn when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Conditions in declaration order
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl BlockConfig {
    /// Number of trials this block expands to
    pub fn trial_count(&self) -> usize {
        self.conditions.len() * self.repetitions as usize
    }

    /// Look up a condition by id
    pub fn condition(&self, id: u32) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == id)
    }
}

/// A complete experiment description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolDescription {
    /// Format version, required
    #[serde(default)]
    pub version: Option<u32>,
    /// Experiment name, used for the run directory
    #[serde(default)]
    pub name: String,
    /// Arena settings
    #[serde(default)]
    pub arena: ArenaSettings,
    /// Pretrial phase
    #[serde(default)]
    pub pretrial: PhaseConfig,
    /// Block phase, required
    #[serde(default)]
    pub block: Option<BlockConfig>,
    /// Intertrial phase
    #[serde(default)]
    pub intertrial: IntertrialConfig,
    /// Posttrial phase
    #[serde(default)]
    pub posttrial: PhaseConfig,
}

impl ProtocolDescription {
    /// Grayscale level used when a display does not specify one
    pub fn default_gs_level(&self) -> u8 {
        self.arena.color_depth.unwrap_or(4)
    }

    /// Every plugin action name referenced anywhere in the description
    pub fn plugin_actions(&self) -> Vec<&str> {
        let phase_actions = self
            .pretrial
            .actions
            .iter()
            .chain(self.intertrial.actions.iter())
            .chain(self.posttrial.actions.iter())
            .filter_map(|a| match a {
                ActionSpec::Plugin { name, .. } => Some(name.as_str()),
                _ => None,
            });

        let condition_actions = self
            .block
            .iter()
            .flat_map(|b| b.conditions.iter())
            .filter_map(|c| c.action.as_deref());

        let mut names: Vec<&str> = phase_actions.chain(condition_actions).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn default_true() -> bool {
    true
}

fn default_repetitions() -> u32 {
    1
}
