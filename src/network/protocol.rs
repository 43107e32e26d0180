//! Line protocol
//!
//! Both channels speak newline-terminated text. The primary channel greets with
//! `HELLO:<client>` (plus `:<side-channel port>` in adaptive mode) and answers
//! each request line with `ERROR:<message>` or `FILE:<length>` followed by the
//! raw bytes. The side channel takes a decimal client id, answers `OK`, then
//! accepts decimal speed updates.

use crate::core::error::ProtocolError;
use crate::core::types::ClientId;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Reply to a request that could not be framed
pub const INTERNAL_ERROR: &str = "Internal Server Error";
/// Reply to a request that tries to leave the served directory
pub const ILLEGAL_PATH: &str = "Illegal path";
/// Reply to a request naming a directory
pub const IS_DIRECTORY: &str = "File is a directory";
/// Side-channel handshake acknowledgement
pub const HANDSHAKE_OK: &[u8] = b"OK\n";

/// Primary-channel greeting
pub fn hello_line(client_id: ClientId, adaptive_port: Option<u16>) -> String {
    match adaptive_port {
        Some(port) => format!("HELLO:{}:{}\n", client_id, port),
        None => format!("HELLO:{}\n", client_id),
    }
}

/// `ERROR:<message>` reply
pub fn error_line(message: &str) -> String {
    format!("ERROR:{}\n", message)
}

/// `FILE:<length>` header preceding a file body
pub fn file_header(length: u64) -> String {
    format!("FILE:{}\n", length)
}

/// OS error text without Rust's `(os error N)` suffix
pub fn describe_io_error(err: &io::Error) -> String {
    let text = err.to_string();
    match text.find(" (os error") {
        Some(end) => text[..end].to_string(),
        None => text,
    }
}

/// Whether a request path refers to a parent directory
pub fn contains_parent_path(path: &str) -> bool {
    path == ".." || path.starts_with("../") || path.ends_with("/..") || path.contains("/../")
}

/// Resolve a request under the served directory; leading `/` are ignored
pub fn resolve_request(root: &Path, request: &str) -> PathBuf {
    root.join(request.trim_start_matches('/'))
}

/// Parse a side-channel handshake line into a client id
pub fn parse_client_id(line: &str) -> Result<ClientId, ProtocolError> {
    parse_integer(line)
        .and_then(|value| u64::try_from(value).ok())
        .map(ClientId::new)
        .ok_or_else(|| ProtocolError::MalformedHandshake(line.to_string()))
}

/// Parse a speed update; any integer is accepted and later clamped by the registry
pub fn parse_speed(line: &str) -> Result<i64, ProtocolError> {
    parse_integer(line).ok_or_else(|| ProtocolError::MalformedSpeedUpdate(line.to_string()))
}

// Decimal, or hexadecimal with a 0x prefix, optionally signed
fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => digits.parse().ok()?,
        None => return None,
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// One unit read off a line-oriented stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, whitespace trimmed
    Line(String),
    /// The line grew past the length limit; the rest of it is skipped
    Overlong,
    /// End of stream
    Closed,
}

/// Splits a byte stream into bounded lines.
///
/// State survives between calls, so a read that times out half way through a
/// line loses nothing.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineFramer {
    /// Framer that rejects lines longer than `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len.min(4096)),
            max_len,
            discarding: false,
        }
    }

    /// Consume bytes from `chunk`. Returns how many were used and the frame they completed.
    pub fn feed(&mut self, chunk: &[u8]) -> (usize, Option<Frame>) {
        match chunk.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                let skipping = std::mem::replace(&mut self.discarding, false);
                if skipping {
                    return (newline + 1, None);
                }
                self.buffer.extend_from_slice(&chunk[..newline]);
                let frame = if self.buffer.len() > self.max_len {
                    Frame::Overlong
                } else {
                    Frame::Line(String::from_utf8_lossy(&self.buffer).trim().to_string())
                };
                self.buffer.clear();
                (newline + 1, Some(frame))
            }
            None if self.discarding => (chunk.len(), None),
            None => {
                self.buffer.extend_from_slice(chunk);
                if self.buffer.len() > self.max_len {
                    self.buffer.clear();
                    self.discarding = true;
                    return (chunk.len(), Some(Frame::Overlong));
                }
                (chunk.len(), None)
            }
        }
    }

    /// Read the next frame from a blocking reader
    pub fn read_frame<R: BufRead>(&mut self, reader: &mut R) -> io::Result<Frame> {
        loop {
            let (used, frame) = {
                let chunk = reader.fill_buf()?;
                if chunk.is_empty() {
                    return Ok(Frame::Closed);
                }
                self.feed(chunk)
            };
            reader.consume(used);
            if let Some(frame) = frame {
                return Ok(frame);
            }
        }
    }

    /// Read the next frame from an async reader. Cancel safe.
    pub async fn read_frame_async<R>(&mut self, reader: &mut R) -> io::Result<Frame>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            let (used, frame) = {
                let chunk = reader.fill_buf().await?;
                if chunk.is_empty() {
                    return Ok(Frame::Closed);
                }
                self.feed(chunk)
            };
            reader.consume(used);
            if let Some(frame) = frame {
                return Ok(frame);
            }
        }
    }
}
