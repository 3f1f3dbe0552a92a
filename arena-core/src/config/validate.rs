//! Protocol description loading and validation
//!
//! Validation runs before any hardware I/O. A description that fails here
//! must never partially start a run.

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use arena_protocol::ColorDepth;

use super::types::{
    ActionSpec, DisplaySpec, FrameSpec, ProtocolDescription, MAX_DISPLAY_DURATION_S,
    PROTOCOL_VERSION,
};

/// Reasons a protocol description is rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("protocol description could not be parsed: {0}")]
    Parse(String),
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("block has no conditions")]
    NoConditions,
    #[error("block repetitions must be at least 1")]
    ZeroRepetitions,
    #[error("condition id {0} is declared more than once")]
    DuplicateCondition(u32),
    #[error("{context}: duration {value} s is out of range")]
    InvalidDuration { context: String, value: f64 },
    #[error("{context}: color depth {bits} is not 1 or 4")]
    InvalidColorDepth { context: String, bits: u8 },
    #[error("{context}: plugin action name is empty")]
    EmptyActionName { context: String },
    #[error("{context}: unknown field `{field}`")]
    UnknownField { context: String, field: String },
    #[error("{context}: invalid frame: {reason}")]
    InvalidFrame { context: String, reason: String },
    #[error("{context}: a condition cannot set both a plugin action and a frame")]
    ConflictingStimulus { context: String },
    #[error("no plugin registered for action `{0}`")]
    UnknownAction(String),
    #[error("seed {0} does not fit the trial-order record")]
    SeedOutOfRange(u64),
    #[error("recorded trial order does not match the block: {0}")]
    ReplayMismatch(String),
}

impl ProtocolDescription {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(input: &str) -> Result<Self, ProtocolError> {
        let protocol: ProtocolDescription =
            toml::from_str(input).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        protocol.validate()?;
        Ok(protocol)
    }

    /// Check every field the scheduler relies on
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let version = self.version.ok_or(ProtocolError::MissingField("version"))?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }

        if let Some(bits) = self.arena.color_depth {
            check_depth("arena", bits)?;
        }

        check_phase_duration("pretrial", self.pretrial.duration_s)?;
        check_phase_duration("intertrial", self.intertrial.duration_s)?;
        check_phase_duration("posttrial", self.posttrial.duration_s)?;
        check_actions("pretrial", &self.pretrial.actions)?;
        check_actions("intertrial", &self.intertrial.actions)?;
        check_actions("posttrial", &self.posttrial.actions)?;

        let block = self.block()?;
        if block.conditions.is_empty() {
            return Err(ProtocolError::NoConditions);
        }
        if block.repetitions == 0 {
            return Err(ProtocolError::ZeroRepetitions);
        }
        if let Some(seed) = block.seed {
            if seed > i64::MAX as u64 {
                return Err(ProtocolError::SeedOutOfRange(seed));
            }
        }

        let mut seen = BTreeSet::new();
        for condition in &block.conditions {
            if !seen.insert(condition.id) {
                return Err(ProtocolError::DuplicateCondition(condition.id));
            }
            let context = format!("condition {}", condition.id);
            if let Some(field) = condition.extra.keys().next() {
                return Err(ProtocolError::UnknownField {
                    context,
                    field: field.clone(),
                });
            }
            check_display(&context, &condition.display)?;
            if let Some(action) = &condition.action {
                if action.trim().is_empty() {
                    return Err(ProtocolError::EmptyActionName { context });
                }
                if condition.frame.is_some() {
                    return Err(ProtocolError::ConflictingStimulus { context });
                }
            }
            if let Some(frame) = &condition.frame {
                check_frame(&context, frame)?;
            }
        }

        Ok(())
    }

    /// The block phase, which every valid description has
    pub fn block(&self) -> Result<&super::types::BlockConfig, ProtocolError> {
        self.block.as_ref().ok_or(ProtocolError::MissingField("block"))
    }
}

fn check_depth(context: &str, bits: u8) -> Result<(), ProtocolError> {
    match bits {
        1 | 4 => Ok(()),
        _ => Err(ProtocolError::InvalidColorDepth {
            context: context.to_string(),
            bits,
        }),
    }
}

fn check_phase_duration(context: &str, value: f64) -> Result<(), ProtocolError> {
    if !value.is_finite() || value < 0.0 || Duration::try_from_secs_f64(value).is_err() {
        return Err(ProtocolError::InvalidDuration {
            context: context.to_string(),
            value,
        });
    }
    Ok(())
}

fn check_display(context: &str, display: &DisplaySpec) -> Result<(), ProtocolError> {
    if !display.duration_s.is_finite()
        || display.duration_s < 0.0
        || display.duration_s > MAX_DISPLAY_DURATION_S
    {
        return Err(ProtocolError::InvalidDuration {
            context: context.to_string(),
            value: display.duration_s,
        });
    }
    if let Some(bits) = display.gs_level {
        check_depth(context, bits)?;
    }
    Ok(())
}

fn check_frame(context: &str, frame: &FrameSpec) -> Result<(), ProtocolError> {
    let invalid = |reason: String| ProtocolError::InvalidFrame {
        context: context.to_string(),
        reason,
    };
    let depth = ColorDepth::from_bits(frame.depth).map_err(|e| invalid(e.to_string()))?;
    frame.encode().map_err(|e| invalid(e.to_string()))?;
    if let Some(value) = frame
        .rows
        .iter()
        .flatten()
        .copied()
        .find(|&v| v > depth.max_value())
    {
        return Err(invalid(format!(
            "pixel value {} exceeds the {}-bit maximum {}",
            value,
            depth.bits(),
            depth.max_value()
        )));
    }
    Ok(())
}

fn check_actions(phase: &str, actions: &[ActionSpec]) -> Result<(), ProtocolError> {
    for (i, action) in actions.iter().enumerate() {
        let context = format!("{} action {}", phase, i);
        match action {
            ActionSpec::SetColorDepth { bits } => check_depth(&context, *bits)?,
            ActionSpec::Pattern(display) => check_display(&context, display)?,
            ActionSpec::Frame(frame) => check_frame(&context, frame)?,
            ActionSpec::Plugin { name, .. } if name.trim().is_empty() => {
                return Err(ProtocolError::EmptyActionName { context });
            }
            _ => {}
        }
    }
    Ok(())
}
