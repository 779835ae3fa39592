//! STOMP-style text framing.
//!
//! # Wire Format
//!
//! ```text
//! COMMAND\n
//! header:value\n
//! ...
//! \n
//! <body>\0
//! ```
//!
//! A heartbeat tick is a bare newline with no command. Header names and
//! values are escaped (`\\`, `\n`, `\r`, `:`) so arbitrary text survives a
//! round trip. `decode` never performs I/O: a truncated buffer yields
//! `Ok(None)` so the transport can keep accumulating bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum frame size (16MB) to bound the decode buffer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const HEADER_ACCEPT: &str = "accept-version";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_ID: &str = "id";
pub const HEADER_RECEIPT: &str = "receipt";
pub const HEADER_RECEIPT_ID: &str = "receipt-id";
pub const HEADER_TRANSACTION: &str = "transaction";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_HEART_BEAT: &str = "heart-beat";
pub const HEADER_HOST: &str = "host";
pub const HEADER_MESSAGE: &str = "message";

const TERMINATOR: u8 = 0;

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
    Begin,
    Commit,
    /// Bare newline liveness tick.
    Heartbeat,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Heartbeat => "",
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let command = match line {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            _ => return None,
        };
        Some(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Heartbeat => f.write_str("HEARTBEAT"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One protocol frame: command, ordered headers and an optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    headers: Vec<(String, String)>,
    content: Bytes,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            content: Bytes::new(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Command::Heartbeat)
    }

    /// Set a header, replacing an existing value with the same name.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Attach a body and the matching `content-length` header.
    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        self.set_header(HEADER_CONTENT_LENGTH, content.len().to_string());
        self.content = content;
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }
}

/// Bytes that cannot form a frame. `consumed` is how many bytes to drop so
/// decoding can resume at the next frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub reason: String,
    pub consumed: usize,
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes skipped)", self.reason, self.consumed)
    }
}

/// Serialize a frame.
pub fn encode(message: &Message) -> Bytes {
    if message.is_heartbeat() {
        return Bytes::from_static(b"\n");
    }

    let mut buf = BytesMut::with_capacity(64 + message.content.len());
    buf.put_slice(message.command.as_str().as_bytes());
    buf.put_u8(b'\n');
    for (name, value) in &message.headers {
        buf.put_slice(escape(name).as_bytes());
        buf.put_u8(b':');
        buf.put_slice(escape(value).as_bytes());
        buf.put_u8(b'\n');
    }
    buf.put_u8(b'\n');
    buf.put_slice(&message.content);
    buf.put_u8(TERMINATOR);
    buf.freeze()
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(Some((message, consumed)))` for a complete frame, `Ok(None)`
/// when more bytes are needed, and `Err` for bytes that can never form a
/// valid frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, MalformedFrame> {
    match buf {
        [] | [b'\r'] => return Ok(None),
        [b'\n', ..] => return Ok(Some((Message::heartbeat(), 1))),
        [b'\r', b'\n', ..] => return Ok(Some((Message::heartbeat(), 2))),
        _ => {}
    }

    // A terminator inside the header block means the frame is broken.
    let malformed = |reason: String, pos: usize| -> Result<Option<(Message, usize)>, MalformedFrame> {
        let consumed = match buf[pos..].iter().position(|b| *b == TERMINATOR) {
            Some(offset) => pos + offset + 1,
            None => buf.len(),
        };
        Err(MalformedFrame { reason, consumed })
    };

    let mut lines = Vec::new();
    let mut pos = 0;
    let body_start = loop {
        let Some(offset) = buf[pos..].iter().position(|b| *b == b'\n') else {
            if buf[pos..].contains(&TERMINATOR) {
                return malformed("frame terminated inside header block".to_string(), pos);
            }
            return Ok(None);
        };
        let raw = &buf[pos..pos + offset];
        if raw.contains(&TERMINATOR) {
            return malformed("frame terminated inside header block".to_string(), pos);
        }
        let line = raw.strip_suffix(b"\r").unwrap_or(raw);
        pos += offset + 1;
        if line.is_empty() {
            break pos;
        }
        lines.push(line);
    };

    let mut lines = lines.into_iter();
    let command_line = match lines.next().map(std::str::from_utf8) {
        Some(Ok(line)) => line,
        Some(Err(_)) => return malformed("command is not valid UTF-8".to_string(), body_start),
        None => return malformed("missing command".to_string(), body_start),
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut header_error = None;
    for line in lines {
        match parse_header(line) {
            Ok((name, value)) => {
                if headers.iter().any(|(existing, _)| *existing == name) {
                    header_error.get_or_insert(format!("duplicate header: {}", name));
                } else {
                    headers.push((name, value));
                }
            }
            Err(reason) => {
                header_error.get_or_insert(reason);
            }
        }
    }

    let declared_length = headers
        .iter()
        .find(|(name, _)| name == HEADER_CONTENT_LENGTH)
        .map(|(_, value)| value.trim().parse::<usize>());

    let (content, frame_end) = match declared_length {
        Some(Ok(length)) => {
            let end = match body_start.checked_add(length) {
                Some(end) if length <= MAX_FRAME_SIZE => end,
                _ => {
                    return malformed(
                        format!("content-length {} exceeds {} bytes", length, MAX_FRAME_SIZE),
                        body_start,
                    )
                }
            };
            if buf.len() <= end {
                return Ok(None);
            }
            if buf[end] != TERMINATOR {
                return malformed(
                    format!("content-length {} does not match body", length),
                    body_start,
                );
            }
            (Bytes::copy_from_slice(&buf[body_start..end]), end + 1)
        }
        Some(Err(_)) => return malformed("invalid content-length value".to_string(), body_start),
        None => match buf[body_start..].iter().position(|b| *b == TERMINATOR) {
            Some(offset) => (
                Bytes::copy_from_slice(&buf[body_start..body_start + offset]),
                body_start + offset + 1,
            ),
            None => return Ok(None),
        },
    };

    let Some(command) = Command::parse(command_line) else {
        return Err(MalformedFrame {
            reason: format!("unknown command: {}", command_line),
            consumed: frame_end,
        });
    };
    if let Some(reason) = header_error {
        return Err(MalformedFrame {
            reason,
            consumed: frame_end,
        });
    }

    Ok(Some((
        Message {
            command,
            headers,
            content,
        },
        frame_end,
    )))
}

fn parse_header(line: &[u8]) -> Result<(String, String), String> {
    let line = std::str::from_utf8(line).map_err(|_| "header is not valid UTF-8".to_string())?;
    let colon = line
        .find(':')
        .ok_or_else(|| format!("header without colon: {}", line))?;
    let name = unescape(&line[..colon])?;
    if name.is_empty() {
        return Err("empty header name".to_string());
    }
    let value = unescape(&line[colon + 1..])?;
    Ok((name, value))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
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

fn unescape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(format!("invalid escape sequence: \\{}", other)),
            None => return Err("dangling escape at end of header".to_string()),
        }
    }
    Ok(out)
}
