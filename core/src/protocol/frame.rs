//! STOMP frame data model and serialization.
//!
//! A [`Frame`] is a command, an ordered header multimap and an opaque body.
//! Frames are produced by [`super::StompCodec`] on the inbound side and built
//! in code on the outbound side; [`Frame::write_to`] renders them back to the
//! wire format:
//!
//! ```text
//! COMMAND\r\n
//! name:value\r\n
//! ...
//! \r\n
//! <body>\0
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Byte that ends every frame on the wire.
pub const FRAME_TERMINATOR: u8 = 0;

/// Line ending used by the serializer.
pub const LINE_ENDING: &[u8] = b"\r\n";

/// The only protocol version this broker negotiates.
pub const PROTOCOL_VERSION: &str = "1.2";

/// Well-known header names.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// Frame command token.
///
/// Unrecognized tokens are kept verbatim in [`Command::Other`] so the session
/// can reject them with a meaningful error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Other(token) => token,
        }
    }

    /// Whether frames with this command may carry a non-empty body.
    pub fn allows_body(&self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Error)
    }

    /// CONNECT and STOMP are interchangeable handshake commands.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Command::Connect | Command::Stomp)
    }
}

impl From<&str> for Command {
    fn from(token: &str) -> Self {
        match token {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => Command::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header multimap.
///
/// Names keep their first-insertion order and every name keeps its values in
/// insertion order. [`FrameHeaders::get`] returns the first value added for a
/// name; later duplicates are retained but shadowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeaders {
    entries: Vec<(String, Vec<String>)>,
}

impl FrameHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` under `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// First value inserted for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Every value inserted for `name`, oldest first.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(key, _)| key == name)
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    /// Every `(name, value)` pair, each exactly once.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| (key.as_str(), value.as_str()))
        })
    }
}

/// Body rule violation detected at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("body not valid for {0} frames")]
    BodyNotAllowed(Command),
}

/// A single protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: FrameHeaders,
    pub body: Bytes,
    /// Set once body framing succeeded. Frames built in code start complete.
    pub complete: bool,
}

impl Frame {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            headers: FrameHeaders::new(),
            body: Bytes::new(),
            complete: true,
        }
    }

    /// Frame whose preface has been read but whose body has not.
    pub(crate) fn pending(command: Command, headers: FrameHeaders) -> Self {
        Self {
            command,
            headers,
            body: Bytes::new(),
            complete: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn body_is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Check the command/body rule: only SEND, MESSAGE and ERROR carry bodies.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.command.allows_body() && !self.body_is_empty() {
            return Err(ValidationError::BodyNotAllowed(self.command.clone()));
        }
        Ok(())
    }

    /// Serialized length in bytes.
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + 1 + value.len() + LINE_ENDING.len())
            .sum();
        self.command.as_str().len()
            + LINE_ENDING.len()
            + headers
            + LINE_ENDING.len()
            + self.body.len()
            + 1
    }

    /// Append the wire representation to `dst`. No `content-length` is added;
    /// callers that need length framing set the header themselves.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(self.command.as_str().as_bytes());
        dst.put_slice(LINE_ENDING);
        for (name, value) in self.headers.iter() {
            dst.put_slice(name.as_bytes());
            dst.put_u8(b':');
            dst.put_slice(value.as_bytes());
            dst.put_slice(LINE_ENDING);
        }
        dst.put_slice(LINE_ENDING);
        dst.put_slice(&self.body);
        dst.put_u8(FRAME_TERMINATOR);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// ERROR frame with a plain-text body and explicit length framing.
    pub fn error(message: &str) -> Self {
        let body = format!("{}\r\n", message);
        Frame::new(Command::Error)
            .header(headers::MESSAGE, message)
            .header(headers::CONTENT_TYPE, "text/plain")
            .header(headers::CONTENT_LENGTH, body.len().to_string())
            .with_body(body)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header(headers::RECEIPT_ID, receipt_id)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} headers, {} byte body)",
            self.command,
            self.headers.len(),
            self.body.len()
        )
    }
}
