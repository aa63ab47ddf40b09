use crate::protocol::error::{PeerlinkError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, Message};

/// Byte that terminates every message on the wire.
pub const DELIMITER: u8 = b'\n';

/// Largest line a receiver buffers before giving up on finding a delimiter
/// (16 MB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// JSON codec for line-delimited JSON-RPC.
///
/// Encoded messages are compact JSON followed by a single `\n`; compact
/// serialization never emits a raw newline, so the delimiter is unambiguous.
///
/// # Example
///
/// ```
/// use peerlink_common::transport::JsonLineCodec;
/// use peerlink_common::protocol::{JsonRpcRequest, Message};
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new(1, "echo", json!("multi\nline"));
/// let line = JsonLineCodec::encode_request(&request).unwrap();
/// assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
///
/// let decoded = JsonLineCodec::decode(&line[..line.len() - 1]).unwrap();
/// assert_eq!(decoded, Message::Request(request));
/// ```
pub struct JsonLineCodec;

impl JsonLineCodec {
    pub fn encode(message: &Message) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(message)?;
        buf.push(DELIMITER);
        Ok(buf)
    }

    pub fn encode_request(request: &JsonRpcRequest) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(request)?;
        buf.push(DELIMITER);
        Ok(buf)
    }

    pub fn encode_response(response: &JsonRpcResponse) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(response)?;
        buf.push(DELIMITER);
        Ok(buf)
    }

    /// Decodes one line, delimiter already stripped.
    pub fn decode(line: &[u8]) -> Result<Message> {
        Message::from_slice(line)
    }
}

/// Reassembles delimited lines from arbitrarily split reads.
///
/// Bytes are appended with [`extend`](Self::extend) as they arrive; complete
/// lines come out of [`next_line`](Self::next_line) in arrival order. A
/// partial line stays buffered until its delimiter shows up.
///
/// A line longer than the limit is reported once as
/// [`PeerlinkError::MessageTooLarge`] and dropped whole, including any of
/// its bytes that arrive after the report.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    // bytes of `buf` already known to contain no delimiter
    scanned: usize,
    max_line: usize,
    // inside a rejected line; drop input up to its delimiter
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_line,
            discarding: false,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        let bytes = if self.discarding {
            match bytes.iter().position(|b| *b == DELIMITER) {
                Some(pos) => {
                    self.discarding = false;
                    &bytes[pos + 1..]
                }
                None => return,
            }
        } else {
            bytes
        };
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its delimiter.
    ///
    /// Returns `Ok(None)` while only a partial line is buffered. A line
    /// longer than the limit, complete or not, is dropped and
    /// [`PeerlinkError::MessageTooLarge`] returned in its place.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(pos) = self.buf[self.scanned..].iter().position(|b| *b == DELIMITER) {
            let end = self.scanned + pos;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            self.scanned = 0;
            if line.len() > self.max_line {
                return Err(PeerlinkError::MessageTooLarge(line.len()));
            }
            return Ok(Some(line));
        }

        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            let discarded = self.buf.len();
            self.clear();
            self.discarding = true;
            return Err(PeerlinkError::MessageTooLarge(discarded));
        }
        Ok(None)
    }

    /// Whether the rest of a rejected line is still being dropped.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Number of bytes held that do not yet form a complete line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.discarding = false;
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
