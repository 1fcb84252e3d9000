//! Incremental STOMP frame codec for `tokio_util::codec::Framed`.
//!
//! Decoding is split in two stages. The preface (command line plus header
//! block) is parsed once a blank line has arrived; the decoder then holds a
//! pending [`Frame`] with `complete == false` until the body and its
//! terminator are available. Bodies are framed either by an explicit
//! `content-length` header (binary safe) or by scanning for the next NUL.
//! Both scans resume where the previous `decode` call stopped, so a frame
//! arriving in many small reads is only walked once.

use super::frame::{headers, Command, Frame, FrameHeaders, FRAME_TERMINATOR};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Default upper bound for a single frame (preface + body).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended before a command line was found")]
    MissingCommand,
    #[error("malformed header, no key/value delimiter found: {0:?}")]
    MalformedHeader(String),
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),
    #[error("body not terminated by NUL")]
    BodyNotTerminated,
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame preface is not valid UTF-8")]
    InvalidEncoding,
}

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug)]
enum DecodeState {
    /// `scanned` bytes of the buffer hold no blank line yet.
    Preface { scanned: usize },
    Body {
        frame: Frame,
        content_length: Option<usize>,
        /// Bytes of the already consumed command line and header block.
        preface_len: usize,
        /// `scanned` bytes of the body hold no NUL yet.
        scanned: usize,
    },
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug)]
pub struct StompCodec {
    max_frame_size: usize,
    state: DecodeState,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: DecodeState::Preface { scanned: 0 },
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// The frame whose preface has been decoded while its body is still
    /// outstanding. Always `complete == false`.
    pub fn pending(&self) -> Option<&Frame> {
        match &self.state {
            DecodeState::Preface { .. } => None,
            DecodeState::Body { frame, .. } => Some(frame),
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(ParseError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Split the body off `src`. `Ok(None)` until body and terminator are
    /// buffered; `scanned` then records how far the NUL search got.
    fn take_body(
        &self,
        content_length: Option<usize>,
        preface_len: usize,
        scanned: &mut usize,
        src: &mut BytesMut,
    ) -> Result<Option<Bytes>> {
        match content_length {
            Some(len) => {
                if src.len() <= len {
                    return Ok(None);
                }
                let body = src.split_to(len).freeze();
                if src.get_u8() != FRAME_TERMINATOR {
                    return Err(ParseError::BodyNotTerminated);
                }
                Ok(Some(body))
            }
            None => match src[*scanned..].iter().position(|b| *b == FRAME_TERMINATOR) {
                Some(offset) => {
                    let end = *scanned + offset;
                    self.check_size(preface_len + end)?;
                    let body = src.split_to(end).freeze();
                    src.advance(1);
                    Ok(Some(body))
                }
                None => {
                    self.check_size(preface_len + src.len())?;
                    *scanned = src.len();
                    Ok(None)
                }
            },
        }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop idle newlines left between frames. Returns false when the buffer
/// ends in a lone `\r` that may still become a blank line.
fn skip_blank_lines(src: &mut BytesMut) -> bool {
    loop {
        if src.starts_with(b"\n") {
            src.advance(1);
        } else if src.starts_with(b"\r\n") {
            src.advance(2);
        } else {
            return src.as_ref() != b"\r";
        }
    }
}

/// Find the blank line closing the preface, searching from `from`.
///
/// Returns the offset just past the blank line, or `Err(resume)` with the
/// offset the next search should start from.
fn find_preface_end(buf: &[u8], from: usize) -> std::result::Result<usize, usize> {
    let mut at = from;
    while let Some(offset) = buf[at..].iter().position(|b| *b == b'\n') {
        let newline = at + offset;
        let rest = &buf[newline + 1..];
        if rest.starts_with(b"\n") {
            return Ok(newline + 2);
        }
        if rest.starts_with(b"\r\n") {
            return Ok(newline + 3);
        }
        if rest.is_empty() || rest == b"\r" {
            return Err(newline);
        }
        at = newline + 1;
    }
    Err(buf.len())
}

/// Next `\n`-terminated line starting at `from`, without its line ending.
/// Returns the line and the offset just past it.
fn next_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let end = from + buf[from..].iter().position(|b| *b == b'\n')?;
    let mut line = &buf[from..end];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    Some((line, end + 1))
}

fn to_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidEncoding)
}

/// Parse command and headers. `Ok(None)` until the terminating blank line
/// has been received.
fn parse_preface(buf: &[u8]) -> Result<Option<(Command, FrameHeaders, usize)>> {
    let (command_line, mut offset) = match next_line(buf, 0) {
        Some(line) => line,
        None => return Ok(None),
    };
    if command_line.is_empty() {
        return Err(ParseError::MissingCommand);
    }
    let command = Command::from(to_str(command_line)?);

    let mut frame_headers = FrameHeaders::new();
    loop {
        let (line, next) = match next_line(buf, offset) {
            Some(line) => line,
            None => return Ok(None),
        };
        offset = next;
        if line.is_empty() {
            return Ok(Some((command, frame_headers, offset)));
        }

        let line = to_str(line)?;
        match line.split_once(':') {
            Some((name, value)) => frame_headers.add(name, value),
            None => return Err(ParseError::MalformedHeader(line.to_string())),
        }
    }
}

fn parse_content_length(frame_headers: &FrameHeaders) -> Result<Option<usize>> {
    match frame_headers.get(headers::CONTENT_LENGTH) {
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ParseError::InvalidContentLength(value.to_string())),
        None => Ok(None),
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // Any error leaves the decoder back in Preface.
        let (mut frame, content_length, preface_len, mut scanned) = match std::mem::replace(
            &mut self.state,
            DecodeState::Preface { scanned: 0 },
        ) {
            DecodeState::Body {
                frame,
                content_length,
                preface_len,
                scanned,
            } => (frame, content_length, preface_len, scanned),
            DecodeState::Preface { scanned } => {
                if scanned == 0 && (!skip_blank_lines(src) || src.is_empty()) {
                    return Ok(None);
                }

                let end = match find_preface_end(src, scanned) {
                    Ok(end) => end,
                    Err(resume) => {
                        self.check_size(src.len())?;
                        self.state = DecodeState::Preface { scanned: resume };
                        return Ok(None);
                    }
                };
                self.check_size(end)?;
                let (command, frame_headers, consumed) = match parse_preface(&src[..end])? {
                    Some(preface) => preface,
                    None => return Err(ParseError::Truncated),
                };
                let content_length = parse_content_length(&frame_headers)?;
                if let Some(len) = content_length {
                    self.check_size(consumed.saturating_add(len))?;
                }
                src.advance(consumed);
                trace!(command = %command, ?content_length, "decoded frame preface");

                (Frame::pending(command, frame_headers), content_length, consumed, 0)
            }
        };

        match self.take_body(content_length, preface_len, &mut scanned, src)? {
            Some(body) => {
                frame.body = body;
                frame.complete = true;
                Ok(Some(frame))
            }
            None => {
                self.state = DecodeState::Body {
                    frame,
                    content_length,
                    preface_len,
                    scanned,
                };
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        let idle = src.iter().all(|b| *b == b'\r' || *b == b'\n');
        match self.state {
            DecodeState::Preface { .. } if idle => {
                src.clear();
                Ok(None)
            }
            _ => Err(ParseError::Truncated),
        }
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = ParseError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.write_to(dst);
        Ok(())
    }
}

impl Frame {
    /// Parse exactly one frame from a complete buffer.
    ///
    /// Trailing bytes after the terminator are ignored. A buffer that ends
    /// before the frame does fails with [`ParseError::Truncated`], or
    /// [`ParseError::MissingCommand`] if it holds nothing but blank lines.
    pub fn parse(bytes: &[u8]) -> Result<Frame> {
        let mut codec = StompCodec::with_max_frame_size(usize::MAX);
        let mut buf = BytesMut::from(bytes);
        match codec.decode(&mut buf)? {
            Some(frame) => Ok(frame),
            None if codec.pending().is_none()
                && buf.iter().all(|b| *b == b'\r' || *b == b'\n') =>
            {
                Err(ParseError::MissingCommand)
            }
            None => Err(ParseError::Truncated),
        }
    }
}
