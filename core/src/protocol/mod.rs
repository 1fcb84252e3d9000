//! # Stompbox Protocol Module
//!
//! This module implements the STOMP 1.2 wire format used between clients and
//! the broker.
//!
//! ## Wire Format
//!
//! ```text
//! COMMAND\r\n
//! header-name:header-value\r\n
//! ...
//! \r\n
//! body\0
//! ```
//!
//! Bodies are framed in one of two ways:
//!
//! - **Explicit length**: a `content-length` header gives the exact body size,
//!   so the body may contain any bytes including NUL
//! - **Terminator scan**: without `content-length` the body runs to the next
//!   NUL byte
//!
//! Blank lines between frames are skipped, and `\r\n` and `\n` line endings
//! are both accepted.
//!
//! ## Modules
//!
//! - [`frame`] - Frame, command and header types plus serialization
//! - [`codec`] - Incremental decoder/encoder for `tokio_util::codec::Framed`

pub mod codec;
pub mod frame;


pub use codec::{ParseError, StompCodec, DEFAULT_MAX_FRAME_SIZE};
pub use frame::{
    headers, Command, Frame, FrameHeaders, ValidationError, FRAME_TERMINATOR, PROTOCOL_VERSION,
};
