//! STOMP 1.2 frame model
//!
//! A frame is a command line, an ordered list of headers and an opaque body.
//! Only the subset of commands a subscribing client needs is modelled.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::codec::CodecError;
use crate::timing;

/// STOMP frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    /// CONNECT and CONNECTED frames carry headers verbatim (no escaping)
    pub fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(CodecError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heart-beat intervals in milliseconds (`cx,cy` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often this side sends (0 = never)
    pub outgoing_ms: u64,
    /// How often this side wants to receive (0 = never)
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parse a `heart-beat` header value
    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        Some(Self {
            outgoing_ms: out.trim().parse().ok()?,
            incoming_ms: inc.trim().parse().ok()?,
        })
    }

    /// Effective intervals for the client given what the broker announced.
    ///
    /// The result's `outgoing_ms` is how often the client must send and
    /// `incoming_ms` is how often it can expect traffic from the broker.
    /// Both are capped at [`timing::HEARTBEAT_MAX_MS`].
    pub fn negotiate(client: HeartBeat, server: HeartBeat) -> HeartBeat {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs).min(timing::HEARTBEAT_MAX_MS)
            }
        };
        HeartBeat {
            outgoing_ms: pick(client.outgoing_ms, server.incoming_ms),
            incoming_ms: pick(client.incoming_ms, server.outgoing_ms),
        }
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with no headers and an empty body
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header (builder style)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body (builder style)
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for a header name. Repeated headers keep the first entry.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame with protocol headers followed by caller headers
    pub fn connect<'a>(
        host: &str,
        heart_beat: HeartBeat,
        extra: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.to_string());
        for (name, value) in extra {
            frame.headers.push((name.clone(), value.clone()));
        }
        frame
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

    /// Body as UTF-8 text, lossy
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
