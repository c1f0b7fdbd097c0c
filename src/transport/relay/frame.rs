//! Minimal STOMP 1.x frame codec.
//!
//! Frames are `COMMAND\nheader:value\n...\n\nbody\0`; a bare LF between
//! frames is a heartbeat. Only the commands the broker conversation actually
//! uses are modeled.

use crate::error::SyncError;

const LF: char = '\n';
const NULL: char = '\0';

/// Protocol versions offered during CONNECT.
pub const ACCEPT_VERSIONS: &str = "1.0,1.1,1.2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame with heartbeat negotiation and an optional login cookie
    /// already carried by the WebSocket handshake.
    pub fn connect(host: &str, heartbeat_ms: u64) -> Self {
        Frame::new("CONNECT")
            .header("accept-version", ACCEPT_VERSIONS)
            .header("host", host)
            .header("heart-beat", format!("{0},{0}", heartbeat_ms))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new("SUBSCRIBE")
            .header("id", id)
            .header("destination", destination)
    }

    pub fn send(destination: &str, body: String) -> Self {
        Frame::new("SEND")
            .header("destination", destination)
            .body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new("DISCONNECT")
    }

    /// Serialize to the on-wire text, NUL terminated.
    pub fn marshal(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(&self.command);
        out.push(LF);
        let mut has_content_length = false;
        for (name, value) in &self.headers {
            if name == "content-length" {
                has_content_length = true;
            }
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push(LF);
        }
        if !self.body.is_empty() && !has_content_length {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push(LF);
        }
        out.push(LF);
        out.push_str(&self.body);
        out.push(NULL);
        out
    }

    /// Parse one inbound frame. Returns `None` for heartbeats (bare LF).
    pub fn unmarshal(data: &str) -> Result<Option<Frame>, SyncError> {
        let data = data.trim_start_matches(LF);
        let data = data.strip_suffix(NULL).unwrap_or(data);
        if data.is_empty() {
            return Ok(None);
        }

        let (head, body) = match data.split_once("\n\n") {
            Some((head, body)) => (head, body),
            None => (data, ""),
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SyncError::ProtocolViolation("empty STOMP command".into()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                SyncError::ProtocolViolation(format!("malformed STOMP header: {:?}", line))
            })?;
            headers.push((name.to_string(), value.to_string()));
        }

        Ok(Some(Frame {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}
