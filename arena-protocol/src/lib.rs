//! LED Arena Wire Protocol
//!
//! This crate defines the bytes exchanged between the host and an LED panel
//! arena controller. It has no I/O of its own; the host crate owns transports.
//!
//! # Protocol Overview
//!
//! A panel image is packed into a frame block:
//! ```text
//! ┌─────────┬──────────┬──────────────────────────┐
//! │ ADDRESS │ SELECTOR │ DATA                     │
//! │ 1B      │ 1B       │ 50B (1-bit) / 200B (4-bit)│
//! └─────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Control commands are length-prefixed, responses echo the opcode:
//! ```text
//! command:  [LEN][OPCODE][PARAMS...]
//! response: [LEN][STATUS][OPCODE][MESSAGE...]
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

pub mod frame;
pub mod messages;

pub use frame::{
    decode_frame, encode_frame, encode_rows, ColorDepth, DecodedFrame, EncodeError, FrameBlock,
    PixelGrid, PANEL_SIZE,
};
pub use messages::{
    split_command, ArenaCommand, RawCommand, Response, ResponseParser, TrialParams, WireError,
};
