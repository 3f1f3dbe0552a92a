//! Command and response messages for the arena controller
//!
//! Host → arena commands come in two shapes:
//! - Short commands: `[LEN][OPCODE][PARAMS...]` where LEN counts the bytes after itself
//! - Frame stream: `[0x32][LEN_LO][LEN_HI][FRAME BLOCK...]`
//!
//! Arena → host responses are always `[LEN][STATUS][OPCODE][MESSAGE...]`,
//! LEN counting the bytes after itself. STATUS 0x00 means accepted.

use core::fmt;

use heapless::Vec;

use crate::frame::{ColorDepth, MAX_FRAME_BLOCK_SIZE};

// Opcodes: host → arena
pub const CMD_ALL_OFF: u8 = 0x00;
pub const CMD_SET_COLOR_DEPTH: u8 = 0x06;
pub const CMD_TRIAL_PARAMS: u8 = 0x08;
pub const CMD_STOP_DISPLAY: u8 = 0x30;
pub const CMD_STREAM_FRAME: u8 = 0x32;
pub const CMD_ALL_ON: u8 = 0xFF;

/// Response status for an accepted command
pub const STATUS_OK: u8 = 0x00;

/// Parameter bytes in a trial-params command
pub const TRIAL_PARAMS_LEN: usize = 11;

/// Largest encoded command (frame stream with a four-bit block)
pub const MAX_COMMAND_SIZE: usize = 3 + MAX_FRAME_BLOCK_SIZE;

/// Largest response message text
pub const MAX_MESSAGE_SIZE: usize = 253;

/// Largest encoded response
pub const MAX_RESPONSE_SIZE: usize = MAX_MESSAGE_SIZE + 3;

/// Encoded command bytes
pub type CommandBuffer = Vec<u8, MAX_COMMAND_SIZE>;

/// Errors on the command/response wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Command payload exceeds the buffer
    PayloadTooLarge,
    /// Length byte is impossible for this message
    InvalidLength(u8),
    /// Not enough bytes for the declared message
    Incomplete,
    /// Opcode is not one the arena understands
    UnknownOpcode(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::PayloadTooLarge => write!(f, "payload too large"),
            WireError::InvalidLength(len) => write!(f, "invalid length byte {}", len),
            WireError::Incomplete => write!(f, "message incomplete"),
            WireError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{:02X}", op),
        }
    }
}

/// Parameters of a single trial display
///
/// The pattern must already be resident on the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialParams {
    /// Grayscale level of the pattern (bits per pixel)
    pub gs_level: u8,
    /// Pattern identifier on the arena
    pub pattern_id: u16,
    /// Frames per second; negative plays backwards
    pub frame_rate: i16,
    /// Number of times the sequence repeats
    pub repeat_count: u16,
    /// Frame index to start on
    pub start_frame: u16,
    /// Trial duration in 100 ms units
    pub duration_units: u16,
}

impl TrialParams {
    /// Encode the parameter bytes (little-endian fields)
    pub fn to_bytes(&self) -> [u8; TRIAL_PARAMS_LEN] {
        let mut out = [0u8; TRIAL_PARAMS_LEN];
        out[0] = self.gs_level;
        out[1..3].copy_from_slice(&self.pattern_id.to_le_bytes());
        out[3..5].copy_from_slice(&self.frame_rate.to_le_bytes());
        out[5..7].copy_from_slice(&self.repeat_count.to_le_bytes());
        out[7..9].copy_from_slice(&self.start_frame.to_le_bytes());
        out[9..11].copy_from_slice(&self.duration_units.to_le_bytes());
        out
    }

    /// Parse parameter bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != TRIAL_PARAMS_LEN {
            return Err(WireError::Incomplete);
        }
        let le = |i: usize| [bytes[i], bytes[i + 1]];
        Ok(Self {
            gs_level: bytes[0],
            pattern_id: u16::from_le_bytes(le(1)),
            frame_rate: i16::from_le_bytes(le(3)),
            repeat_count: u16::from_le_bytes(le(5)),
            start_frame: u16::from_le_bytes(le(7)),
            duration_units: u16::from_le_bytes(le(9)),
        })
    }
}

/// Commands from the host to the arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaCommand<'a> {
    /// Turn every pixel off
    AllOff,
    /// Turn every pixel on
    AllOn,
    /// Abort the current display sequence
    StopDisplay,
    /// Select the grayscale depth for subsequent displays
    SetColorDepth(ColorDepth),
    /// Display a resident pattern
    TrialParams(TrialParams),
    /// Display a frame block built on the host
    StreamFrame(&'a [u8]),
}

impl<'a> ArenaCommand<'a> {
    /// Opcode echoed back in the acknowledgement
    pub fn opcode(&self) -> u8 {
        match self {
            ArenaCommand::AllOff => CMD_ALL_OFF,
            ArenaCommand::AllOn => CMD_ALL_ON,
            ArenaCommand::StopDisplay => CMD_STOP_DISPLAY,
            ArenaCommand::SetColorDepth(_) => CMD_SET_COLOR_DEPTH,
            ArenaCommand::TrialParams(_) => CMD_TRIAL_PARAMS,
            ArenaCommand::StreamFrame(_) => CMD_STREAM_FRAME,
        }
    }

    /// Short human-readable name, used in logs
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }

    /// Encode this command into wire bytes
    pub fn encode(&self) -> Result<CommandBuffer, WireError> {
        let mut buf = CommandBuffer::new();
        match self {
            ArenaCommand::AllOff | ArenaCommand::AllOn | ArenaCommand::StopDisplay => {
                push_all(&mut buf, &[0x01, self.opcode()])?;
            }
            ArenaCommand::SetColorDepth(depth) => {
                push_all(&mut buf, &[0x02, CMD_SET_COLOR_DEPTH, depth.bits()])?;
            }
            ArenaCommand::TrialParams(params) => {
                push_all(&mut buf, &[(TRIAL_PARAMS_LEN + 1) as u8, CMD_TRIAL_PARAMS])?;
                push_all(&mut buf, &params.to_bytes())?;
            }
            ArenaCommand::StreamFrame(block) => {
                if block.len() > MAX_FRAME_BLOCK_SIZE {
                    return Err(WireError::PayloadTooLarge);
                }
                let len = (block.len() as u16).to_le_bytes();
                push_all(&mut buf, &[CMD_STREAM_FRAME, len[0], len[1]])?;
                push_all(&mut buf, block)?;
            }
        }
        Ok(buf)
    }
}

fn push_all(buf: &mut CommandBuffer, bytes: &[u8]) -> Result<(), WireError> {
    buf.extend_from_slice(bytes)
        .map_err(|_| WireError::PayloadTooLarge)
}

/// Name of an opcode for logging
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        CMD_ALL_OFF => "all_off",
        CMD_ALL_ON => "all_on",
        CMD_STOP_DISPLAY => "stop_display",
        CMD_SET_COLOR_DEPTH => "set_color_depth",
        CMD_TRIAL_PARAMS => "trial_params",
        CMD_STREAM_FRAME => "stream_frame",
        _ => "unknown",
    }
}

/// A command split into opcode and parameter bytes (arena side view)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCommand<'a> {
    /// Command opcode
    pub opcode: u8,
    /// Parameter bytes following the opcode
    pub params: &'a [u8],
}

/// Split one encoded command from the front of `bytes`
///
/// Returns the command and the number of bytes it occupied. Used by
/// simulated arenas; the host never needs to parse its own commands.
pub fn split_command(bytes: &[u8]) -> Result<(RawCommand<'_>, usize), WireError> {
    let first = *bytes.first().ok_or(WireError::Incomplete)?;

    if first == CMD_STREAM_FRAME {
        if bytes.len() < 3 {
            return Err(WireError::Incomplete);
        }
        let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        let end = 3 + len;
        if bytes.len() < end {
            return Err(WireError::Incomplete);
        }
        return Ok((
            RawCommand {
                opcode: CMD_STREAM_FRAME,
                params: &bytes[3..end],
            },
            end,
        ));
    }

    if first == 0 {
        return Err(WireError::InvalidLength(first));
    }
    let end = 1 + first as usize;
    if bytes.len() < end {
        return Err(WireError::Incomplete);
    }
    let opcode = bytes[1];
    if opcode_name(opcode) == "unknown" {
        return Err(WireError::UnknownOpcode(opcode));
    }
    Ok((
        RawCommand {
            opcode,
            params: &bytes[2..end],
        },
        end,
    ))
}

/// A response from the arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// 0x00 when accepted, anything else is a negative acknowledgement
    pub status: u8,
    /// Opcode of the command this answers
    pub opcode: u8,
    /// Free-form message text
    pub message: Vec<u8, MAX_MESSAGE_SIZE>,
}

impl Response {
    /// Create a response with a text message (truncated to fit)
    pub fn new(status: u8, opcode: u8, message: &str) -> Self {
        let bytes = message.as_bytes();
        let len = bytes.len().min(MAX_MESSAGE_SIZE);
        let mut text = Vec::new();
        let _ = text.extend_from_slice(&bytes[..len]);
        Self {
            status,
            opcode,
            message: text,
        }
    }

    /// True if the arena accepted the command
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Message text, lossy on invalid UTF-8
    pub fn message_str(&self) -> &str {
        match core::str::from_utf8(&self.message) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&self.message[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    /// Encode this response (for testing or simulation)
    pub fn encode(&self) -> Vec<u8, MAX_RESPONSE_SIZE> {
        let mut out = Vec::new();
        let _ = out.push((self.message.len() + 2) as u8);
        let _ = out.push(self.status);
        let _ = out.push(self.opcode);
        let _ = out.extend_from_slice(&self.message);
        out
    }
}

/// State machine for parsing responses from a byte stream
#[derive(Debug, Clone)]
pub struct ResponseParser {
    state: ParseState,
    expected_length: u8,
    status: u8,
    opcode: u8,
    message: Vec<u8, MAX_MESSAGE_SIZE>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the LENGTH byte
    WaitingForLength,
    /// Got LENGTH, waiting for STATUS
    WaitingForStatus,
    /// Got STATUS, waiting for OPCODE
    WaitingForOpcode,
    /// Reading message bytes
    ReadingMessage,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        Self {
            state: ParseState::WaitingForLength,
            expected_length: 0,
            status: 0,
            opcode: 0,
            message: Vec::new(),
        }
    }

    /// Reset the parser state
    pub fn reset(&mut self) {
        self.state = ParseState::WaitingForLength;
        self.expected_length = 0;
        self.status = 0;
        self.opcode = 0;
        self.message.clear();
    }

    /// True when no partial response is buffered
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::WaitingForLength
    }

    /// Feed a single byte to the parser
    ///
    /// Returns `Ok(Some(response))` when a complete response is parsed,
    /// `Ok(None)` when more bytes are needed, or `Err` on a bad length byte.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Response>, WireError> {
        match self.state {
            ParseState::WaitingForLength => {
                if byte < 2 {
                    self.reset();
                    return Err(WireError::InvalidLength(byte));
                }
                self.expected_length = byte;
                self.state = ParseState::WaitingForStatus;
                Ok(None)
            }
            ParseState::WaitingForStatus => {
                self.status = byte;
                self.state = ParseState::WaitingForOpcode;
                Ok(None)
            }
            ParseState::WaitingForOpcode => {
                self.opcode = byte;
                if self.expected_length == 2 {
                    return Ok(Some(self.finish()));
                }
                self.message.clear();
                self.state = ParseState::ReadingMessage;
                Ok(None)
            }
            ParseState::ReadingMessage => {
                // Length byte caps the message at MAX_MESSAGE_SIZE
                let _ = self.message.push(byte);
                if self.message.len() == self.expected_length as usize - 2 {
                    return Ok(Some(self.finish()));
                }
                Ok(None)
            }
        }
    }

    fn finish(&mut self) -> Response {
        let response = Response {
            status: self.status,
            opcode: self.opcode,
            message: self.message.clone(),
        };
        self.reset();
        response
    }
}
