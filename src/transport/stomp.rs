//! STOMP 1.2 text frame codec.
//!
//! Frames travel as WebSocket text messages:
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! \n
//! body\0
//! ```
//!
//! A message containing only end-of-line characters is a heart-beat.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Maximum accepted frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// STOMP protocol version negotiated in CONNECT
pub const STOMP_VERSION: &str = "1.2";

/// STOMP frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client frames
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,

    // Server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent without escaping
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "DISCONNECT" => Ok(Command::Disconnect),
            "CONNECTED" => Ok(Command::Connected),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Invalid header escape: \\{0}")]
    InvalidEscape(char),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Frame body is not valid UTF-8")]
    InvalidUtf8,
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of a header; the first occurrence wins when repeated
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Body as UTF-8 text
    pub fn body_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.body).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// CONNECT frame opening a session
    pub fn connect(host: &str, token: Option<&str>) -> Self {
        let frame = Frame::new(Command::Connect)
            .with_header("accept-version", STOMP_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", "0,0");
        match token {
            Some(token) => frame.with_header("Authorization", format!("Bearer {}", token)),
            None => frame,
        }
    }

    /// SEND frame carrying a JSON body
    pub fn send_json(destination: &str, json: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(json.into())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }
}

/// Codec for encoding/decoding frames
pub struct StompCodec;

impl StompCodec {
    /// Encode a frame to its wire text
    pub fn encode(frame: &Frame) -> String {
        let escape = frame.command.escapes_headers();
        let body = String::from_utf8_lossy(&frame.body);

        let mut out = String::with_capacity(64 + body.len());
        out.push_str(frame.command.as_str());
        out.push('\n');

        for (name, value) in &frame.headers {
            if name == "content-length" {
                continue;
            }
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }

        if !body.is_empty() {
            out.push_str(&format!("content-length:{}\n", body.len()));
        }

        out.push('\n');
        out.push_str(&body);
        out.push('\0');
        out
    }

    /// Decode wire text into a frame.
    ///
    /// Returns `Ok(None)` for heart-beats.
    pub fn decode(data: &str) -> Result<Option<Frame>, ProtocolError> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len(), MAX_FRAME_SIZE));
        }

        let text = data.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let mut pos = 0;
        let mut lines = Vec::new();
        loop {
            let newline = text[pos..].find('\n').ok_or_else(|| {
                ProtocolError::InvalidFormat("missing end of headers".to_string())
            })?;
            let line = text[pos..pos + newline].trim_end_matches('\r');
            pos += newline + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let mut lines = lines.into_iter();
        let command: Command = lines
            .next()
            .ok_or_else(|| ProtocolError::InvalidFormat("missing command".to_string()))?
            .parse()?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ProtocolError::InvalidFormat(format!("malformed header line: {}", line))
            })?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &text.as_bytes()[pos..];
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value.trim().parse::<usize>().map_err(|_| {
                    ProtocolError::InvalidFormat(format!("invalid content-length: {}", value))
                })
            })
            .transpose()?;

        let body = match content_length {
            Some(len) => {
                if rest.len() <= len || rest[len] != 0 {
                    return Err(ProtocolError::InvalidFormat(
                        "body does not match content-length".to_string(),
                    ));
                }
                &rest[..len]
            }
            None => {
                let end = rest.iter().position(|b| *b == 0).ok_or_else(|| {
                    ProtocolError::InvalidFormat("missing NUL terminator".to_string())
                })?;
                &rest[..end]
            }
        };

        Ok(Some(Frame {
            command,
            headers,
            body: Bytes::copy_from_slice(body),
        }))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            Some(other) => return Err(ProtocolError::InvalidEscape(other)),
            None => {
                return Err(ProtocolError::InvalidFormat(
                    "dangling escape in header".to_string(),
                ))
            }
        }
    }
    Ok(out)
}
