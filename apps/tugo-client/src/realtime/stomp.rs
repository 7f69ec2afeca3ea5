//! STOMP 1.2 frames: commands, builders and the text codec.

use crate::error::FrameError;

/// A lone end-of-line between frames is a STOMP heart-beat.
pub const HEARTBEAT_EOL: &str = "\n";

/// Versions offered in CONNECT.
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client → broker
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
    // Broker → client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
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

    pub fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED headers are sent verbatim; every other frame
    /// escapes them.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(heartbeat_ms: u64) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    /// SEND with a JSON body.
    pub fn send(destination: &str, json_body: &str) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", json_body.len().to_string())
            .with_body(json_body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
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
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode every frame in `input`, skipping heart-beat EOLs between them.
pub fn decode_frames(input: &str) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, consumed) = decode_one(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
}

fn decode_one(input: &str) -> Result<(Frame, usize), FrameError> {
    let mut pos = 0;
    let command = Command::parse(read_line(input, &mut pos)?)?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = read_line(input, &mut pos)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());

    let body_end = match content_length {
        Some(len) => {
            let end = pos.checked_add(len).ok_or(FrameError::Unterminated)?;
            let terminator = end.checked_add(1).ok_or(FrameError::Unterminated)?;
            if input.get(end..terminator) != Some("\0") {
                return Err(FrameError::Unterminated);
            }
            end
        }
        None => pos + input[pos..].find('\0').ok_or(FrameError::Unterminated)?,
    };

    let body = input
        .get(pos..body_end)
        .ok_or(FrameError::Unterminated)?
        .to_string();

    Ok((
        Frame {
            command,
            headers,
            body,
        },
        body_end + 1,
    ))
}

fn read_line<'a>(input: &'a str, pos: &mut usize) -> Result<&'a str, FrameError> {
    let rest = &input[*pos..];
    let end = rest.find('\n').ok_or(FrameError::Unterminated)?;
    *pos += end + 1;
    let line = &rest[..end];
    Ok(line.strip_suffix('\r').unwrap_or(line))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
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
            _ => return Err(FrameError::BadEscape),
        }
    }
    Ok(out)
}
