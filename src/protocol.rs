//! Wire protocol for the PING/PONG link.
//!
//! ```text
//! Handshake: <clientId>                          (server -> client, once, no delimiter)
//! Request:   [<seq>] PING                        (client -> server, no delimiter)
//! Reply:     [<answerSeq>/<seq>] PONG (<clientId>)\n
//! Keepalive: [<answerSeq>] keepalive\n
//! ```
//!
//! Requests carry no terminator and are always written with a single send,
//! so the server treats one read as one request. Replies and keepalives
//! are newline terminated because several of them may arrive in one read.

use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use tracing::warn;

/// Literal that ends every keepalive frame.
pub const KEEPALIVE: &str = "keepalive";

const REQUEST_SUFFIX: &str = "] PING";

/// A newline-delimited frame received by a client, after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Keepalive,
    /// Reply carrying the request sequence it answers.
    Reply { seq: u64 },
}

/// Format a request.
pub fn encode_request(seq: u64) -> String {
    format!("[{seq}] PING")
}

/// Recover the sequence number from a request chunk.
pub fn parse_request(chunk: &[u8]) -> Result<u64, ProtocolError> {
    let malformed = || ProtocolError::MalformedRequest(String::from_utf8_lossy(chunk).into_owned());
    let text = std::str::from_utf8(chunk).map_err(|_| malformed())?;
    text.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(REQUEST_SUFFIX))
        .and_then(|seq| seq.parse().ok())
        .ok_or_else(malformed)
}

/// Format a reply to request `seq`.
pub fn encode_reply(answer: u64, seq: u64, client_id: u32) -> String {
    format!("[{answer}/{seq}] PONG ({client_id})\n")
}

/// Format a keepalive.
pub fn encode_keepalive(answer: u64) -> String {
    format!("[{answer}] {KEEPALIVE}\n")
}

/// A line is a keepalive iff its last nine characters are `keepalive`.
pub fn is_keepalive(line: &str) -> bool {
    line.ends_with(KEEPALIVE)
}

/// Recover the request sequence of a reply: the text between `/` and `]`.
pub fn reply_sequence(line: &str) -> Result<u64, ProtocolError> {
    let slash = line.find('/');
    let bracket = line.find(']');
    match (slash, bracket) {
        (Some(start), Some(end)) if start < end => line[start + 1..end]
            .parse()
            .map_err(|_| ProtocolError::MalformedReply(line.to_string())),
        _ => Err(ProtocolError::MalformedReply(line.to_string())),
    }
}

/// Classify one complete line.
pub fn classify(line: &str) -> Result<Inbound, ProtocolError> {
    if is_keepalive(line) {
        Ok(Inbound::Keepalive)
    } else {
        reply_sequence(line).map(|seq| Inbound::Reply { seq })
    }
}

/// Format the first-contact message carrying the assigned client id.
pub fn encode_handshake(client_id: u32) -> String {
    client_id.to_string()
}

/// Parse the first-contact message.
///
/// Returns the client id and whatever bytes followed its digits in the same
/// read (a keepalive can be coalesced with the handshake).
pub fn parse_handshake(chunk: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    let digits = chunk.iter().take_while(|b| b.is_ascii_digit()).count();
    let invalid = || ProtocolError::InvalidClientId(String::from_utf8_lossy(chunk).into_owned());
    if digits == 0 {
        return Err(invalid());
    }
    let id = std::str::from_utf8(&chunk[..digits])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    Ok((id, &chunk[digits..]))
}

/// Longest unterminated tail [`FrameBuffer::new`] keeps.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Splits a byte stream into newline-terminated lines.
///
/// An unterminated tail is kept until the rest of it arrives, unless it
/// grows past the line limit. An overlong tail is dropped together with the
/// rest of its line.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: BytesMut,
    max_line: usize,
    /// The head of `pending` continues a line that was dropped.
    truncated: bool,
    discarded: u64,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_LINE)
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_line: max_line.max(1),
            truncated: false,
            discarded: 0,
        }
    }

    /// Append a chunk and return every line it completes, without delimiters.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line = self.pending.split_to(pos);
            self.pending.advance(1);
            if std::mem::take(&mut self.truncated) {
                continue;
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        if self.pending.len() > self.max_line {
            if !self.truncated {
                warn!(bytes = self.pending.len(), limit = self.max_line, "Dropping overlong line");
                self.discarded += 1;
            }
            self.pending.clear();
            self.truncated = true;
        }
        lines
    }

    /// Bytes of an incomplete line still waiting for their delimiter.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Lines dropped for exceeding the limit.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        assert_eq!(encode_request(7), "[7] PING");
        assert_eq!(parse_request(b"[7] PING"), Ok(7));
        assert_eq!(parse_request(encode_request(123456).as_bytes()), Ok(123456));
    }

    #[test]
    fn test_malformed_request() {
        assert!(matches!(
            parse_request(b"PING"),
            Err(ProtocolError::MalformedRequest(_))
        ));
        assert!(parse_request(b"[x] PING").is_err());
        assert!(parse_request(b"[1] PONG").is_err());
        assert!(parse_request(b"[1] PING[2] PING").is_err());
    }

    #[test]
    fn test_reply_and_keepalive_shapes() {
        assert_eq!(encode_reply(4, 9, 2), "[4/9] PONG (2)\n");
        assert_eq!(encode_keepalive(11), "[11] keepalive\n");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("[3] keepalive"), Ok(Inbound::Keepalive));
        assert_eq!(classify("[3/17] PONG (1)"), Ok(Inbound::Reply { seq: 17 }));
        assert!(matches!(
            classify("[3] PONG (1)"),
            Err(ProtocolError::MalformedReply(_))
        ));
        assert!(classify("garbage").is_err());
    }

    #[test]
    fn test_handshake() {
        assert_eq!(encode_handshake(12), "12");
        assert_eq!(parse_handshake(b"12"), Ok((12, &b""[..])));

        let (id, rest) = parse_handshake(b"3[0] keepalive\n").unwrap();
        assert_eq!(id, 3);
        assert_eq!(rest, b"[0] keepalive\n");

        assert!(matches!(
            parse_handshake(b""),
            Err(ProtocolError::InvalidClientId(_))
        ));
        assert!(parse_handshake(b"abc").is_err());
    }

    #[test]
    fn test_frame_buffer_coalesced() {
        let mut frames = FrameBuffer::new();
        let lines = frames.push(b"[0/4] PONG (1)\n[1] keepalive\n");
        assert_eq!(lines, vec!["[0/4] PONG (1)", "[1] keepalive"]);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_split_line() {
        let mut frames = FrameBuffer::new();
        assert!(frames.push(b"[0/4] PO").is_empty());
        assert_eq!(frames.pending(), 8);
        assert_eq!(frames.push(b"NG (1)\n[2] kee"), vec!["[0/4] PONG (1)"]);
        assert_eq!(frames.push(b"palive\n"), vec!["[2] keepalive"]);
    }

    #[test]
    fn test_frame_buffer_drops_overlong_line() {
        let mut frames = FrameBuffer::with_limit(16);
        assert!(frames.push(b"[1] keepalive and then some").is_empty());
        assert_eq!(frames.pending(), 0);
        assert_eq!(frames.discarded(), 1);

        // The rest of the dropped line never surfaces as a line of its own.
        assert!(frames.push(&[b'x'; 40]).is_empty());
        assert_eq!(frames.discarded(), 1);
        assert_eq!(frames.push(b"xx\n[2] keepalive\n"), vec!["[2] keepalive"]);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_skips_empty_lines() {
        let mut frames = FrameBuffer::new();
        assert_eq!(frames.push(b"\n\n[5] keepalive\n"), vec!["[5] keepalive"]);
    }
}
