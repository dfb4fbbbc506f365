//! Minimal STOMP 1.2 framing for the shared candle transport.

use crate::error::PipelineError;

const NUL: u8 = 0;
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";
pub const HEARTBEAT_EOL: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "CONNECT" | "STOMP" => Some(Self::Connect),
            "CONNECTED" => Some(Self::Connected),
            "SUBSCRIBE" => Some(Self::Subscribe),
            "UNSUBSCRIBE" => Some(Self::Unsubscribe),
            "SEND" => Some(Self::Send),
            "MESSAGE" => Some(Self::Message),
            "RECEIPT" => Some(Self::Receipt),
            "ERROR" => Some(Self::Error),
            "DISCONNECT" => Some(Self::Disconnect),
            _ => None,
        }
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as the protocol requires for repeated headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if self.command.escapes_headers() {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(NUL);
        out
    }

    /// Text rendition for websocket text messages. Bodies we send are UTF-8.
    pub fn encode_text(&self) -> String {
        String::from_utf8_lossy(&self.encode()).into_owned()
    }

    /// Parses one frame. `Ok(None)` means the input was only heart-beat EOLs.
    pub fn parse(input: &[u8]) -> Result<Option<Self>, PipelineError> {
        let start = input
            .iter()
            .position(|byte| *byte != b'\n' && *byte != b'\r')
            .unwrap_or(input.len());
        let input = &input[start..];
        if input.is_empty() || input == [NUL] {
            return Ok(None);
        }

        let mut cursor = 0_usize;
        let command_line = next_line(input, &mut cursor)
            .ok_or_else(|| PipelineError::Stomp("frame has no command line".to_string()))?;
        let command = StompCommand::parse(command_line)
            .ok_or_else(|| PipelineError::Stomp(format!("unknown command '{command_line}'")))?;

        let mut headers = Vec::new();
        loop {
            let line = next_line(input, &mut cursor)
                .ok_or_else(|| PipelineError::Stomp("unterminated header block".to_string()))?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| PipelineError::Stomp(format!("malformed header '{line}'")))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let rest = &input[cursor..];
        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.trim().parse::<usize>().ok());
        let body = match content_length {
            Some(length) if length <= rest.len() => rest[..length].to_vec(),
            Some(length) => {
                return Err(PipelineError::Stomp(format!(
                    "content-length {length} exceeds remaining {} bytes",
                    rest.len()
                )))
            }
            None => {
                let end = rest.iter().position(|byte| *byte == NUL).unwrap_or(rest.len());
                rest[..end].to_vec()
            }
        };

        Ok(Some(Self {
            command,
            headers,
            body,
        }))
    }
}

fn next_line<'a>(input: &'a [u8], cursor: &mut usize) -> Option<&'a str> {
    let remaining = input.get(*cursor..)?;
    let end = remaining.iter().position(|byte| *byte == b'\n')?;
    *cursor += end + 1;
    let line = &remaining[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    std::str::from_utf8(line).ok()
}

fn escape_header(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_header(value: &str) -> Result<String, PipelineError> {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            unescaped.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => unescaped.push('\\'),
            Some('n') => unescaped.push('\n'),
            Some('r') => unescaped.push('\r'),
            Some('c') => unescaped.push(':'),
            other => {
                return Err(PipelineError::Stomp(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(unescaped)
}

pub fn connect_frame(host: &str, heartbeat_ms: u64) -> StompFrame {
    StompFrame::new(StompCommand::Connect)
        .with_header("accept-version", ACCEPT_VERSION)
        .with_header("host", host)
        .with_header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
}

pub fn subscribe_frame(id: &str, destination: &str) -> StompFrame {
    StompFrame::new(StompCommand::Subscribe)
        .with_header("id", id)
        .with_header("destination", destination)
}

pub fn unsubscribe_frame(id: &str) -> StompFrame {
    StompFrame::new(StompCommand::Unsubscribe).with_header("id", id)
}

pub fn disconnect_frame() -> StompFrame {
    StompFrame::new(StompCommand::Disconnect)
}
