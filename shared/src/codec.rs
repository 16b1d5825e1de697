//! STOMP frame codec
//!
//! All frames are serialized as:
//! ```text
//! COMMAND EOL
//! (name:value EOL)*
//! EOL
//! body NUL
//! ```
//!
//! A bare EOL between frames is a heart-beat. EOL is `\n`, optionally
//! preceded by `\r`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{Command, Frame};

/// Maximum frame size (1 MiB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),

    #[error("Frame header section is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid content-length: {0:?}")]
    BadContentLength(String),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Frame body not terminated by NUL")]
    MissingNul,
}

/// One unit read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    HeartBeat,
}

/// Encode a frame into a new buffer
pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(64 + frame.body.len());
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame directly into a provided buffer
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
    if frame.body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.body.len()));
    }

    let escape = frame.command.escapes_headers();

    buf.put_slice(frame.command.as_str().as_bytes());
    buf.put_u8(b'\n');

    for (name, value) in &frame.headers {
        put_header_part(buf, name, escape);
        buf.put_u8(b':');
        put_header_part(buf, value, escape);
        buf.put_u8(b'\n');
    }

    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        buf.put_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
    }

    buf.put_u8(b'\n');
    buf.put_slice(&frame.body);
    buf.put_u8(0);

    Ok(())
}

fn put_header_part(buf: &mut BytesMut, text: &str, escape: bool) {
    if !escape {
        buf.put_slice(text.as_bytes());
        return;
    }
    for ch in text.chars() {
        match ch {
            '\\' => buf.put_slice(b"\\\\"),
            '\r' => buf.put_slice(b"\\r"),
            '\n' => buf.put_slice(b"\\n"),
            ':' => buf.put_slice(b"\\c"),
            c => {
                let mut tmp = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Locate the blank line closing the header section.
///
/// Returns `(head_len, body_start)`: the head excludes the blank line, the
/// body starts right after it.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        if line.is_empty() || line == b"\r" {
            return Some((line_start, i + 1));
        }
        line_start = i + 1;
    }
    None
}

fn parse_head(head: &[u8]) -> Result<(Command, Vec<(String, String)>), CodecError> {
    let text = std::str::from_utf8(head).map_err(|_| CodecError::InvalidUtf8)?;
    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty());

    let command: Command = lines.next().unwrap_or_default().parse()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok((command, headers))
}

/// Try to decode one frame or heart-beat from a buffer
///
/// Returns:
/// - `Ok(Some(decoded))` if a complete frame or heart-beat was consumed
/// - `Ok(None)` if more data is needed (the buffer is left untouched)
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Decoded>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }

    // Heart-beats
    if buf[0] == b'\n' {
        buf.advance(1);
        return Ok(Some(Decoded::HeartBeat));
    }
    if buf[0] == b'\r' {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[1] == b'\n' {
            buf.advance(2);
            return Ok(Some(Decoded::HeartBeat));
        }
    }

    let Some((head_len, body_start)) = find_header_end(&buf[..]) else {
        return need_more(buf.len());
    };

    let (command, headers) = parse_head(&buf[..head_len])?;

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| CodecError::BadContentLength(v.clone()))
        })
        .transpose()?;

    let body_len = match content_length {
        Some(len) => {
            if len > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge(len));
            }
            let total = body_start + len + 1;
            if buf.len() < total {
                return Ok(None);
            }
            if buf[body_start + len] != 0 {
                return Err(CodecError::MissingNul);
            }
            len
        }
        None => match buf[body_start..].iter().position(|&b| b == 0) {
            Some(len) => len,
            None => return need_more(buf.len()),
        },
    };

    buf.advance(body_start);
    let body = buf.split_to(body_len).freeze();
    buf.advance(1);

    Ok(Some(Decoded::Frame(Frame {
        command,
        headers,
        body,
    })))
}

fn need_more(buffered: usize) -> Result<Option<Decoded>, CodecError> {
    if buffered > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(buffered));
    }
    Ok(None)
}

/// Decoder for streaming input
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame or heart-beat from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Decoded>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Drop whatever is buffered (after an unrecoverable decode error)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
