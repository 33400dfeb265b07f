//! Per-connection state owned by the multiplexer.
//!
//! Each accepted socket gets a 1-based client id, a scratch buffer bounding
//! a single read, and an outbound queue that may take several sends to
//! drain.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Result of one bounded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// Peer closed its side (zero-byte read).
    Closed,
    /// This many bytes are available via [`Connection::inbound`].
    Data(usize),
    WouldBlock,
}

/// A frame waiting in the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    /// Request this frame answers; `None` for keepalives.
    pub request: Option<(DateTime<Local>, String)>,
    /// Frame text without its newline.
    pub payload: String,
    /// Offset one past the frame's last byte, relative to the queue head.
    end: usize,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub client_id: u32,
    pub peer: SocketAddr,
    inbound: Vec<u8>,
    outbound: BytesMut,
    /// Frames behind the bytes in `outbound`, oldest first.
    frames: VecDeque<QueuedFrame>,
    /// Frames whose last byte left with an earlier send.
    flushed: Vec<QueuedFrame>,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, client_id: u32, peer: SocketAddr, read_buffer_size: usize) -> Self {
        Self {
            stream,
            client_id,
            peer,
            inbound: vec![0u8; read_buffer_size],
            outbound: BytesMut::new(),
            frames: VecDeque::new(),
            flushed: Vec::new(),
        }
    }

    /// Perform one read of at most the scratch buffer size.
    pub fn read_once(&mut self) -> io::Result<ReadEvent> {
        match self.stream.read(&mut self.inbound) {
            Ok(0) => Ok(ReadEvent::Closed),
            Ok(n) => Ok(ReadEvent::Data(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadEvent::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadEvent::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// The first `n` bytes of the last read.
    pub fn inbound(&self, n: usize) -> &[u8] {
        &self.inbound[..n.min(self.inbound.len())]
    }

    /// Queue an unsolicited frame behind anything already waiting.
    pub fn enqueue(&mut self, frame: &[u8]) {
        self.push_frame(None, frame, 0);
    }

    /// Queue the reply to `request` behind anything already waiting.
    pub fn enqueue_reply(&mut self, request_at: DateTime<Local>, request: String, frame: &[u8]) {
        self.push_frame(Some((request_at, request)), frame, 0);
    }

    /// Queue `frame` minus the `sent` bytes that already went out directly.
    fn push_frame(&mut self, request: Option<(DateTime<Local>, String)>, frame: &[u8], sent: usize) {
        self.outbound.extend_from_slice(&frame[sent..]);
        self.frames.push_back(QueuedFrame {
            request,
            payload: String::from_utf8_lossy(frame).trim_end_matches('\n').to_string(),
            end: self.outbound.len(),
        });
    }

    /// Account for `n` bytes leaving the head of the queue.
    fn advance_frames(&mut self, n: usize) {
        while let Some(frame) = self.frames.front() {
            if frame.end > n {
                break;
            }
            if let Some(frame) = self.frames.pop_front() {
                self.flushed.push(frame);
            }
        }
        for frame in self.frames.iter_mut() {
            frame.end -= n;
        }
    }

    /// Frames fully sent since the last call, in send order.
    pub fn take_flushed(&mut self) -> Vec<QueuedFrame> {
        std::mem::take(&mut self.flushed)
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Perform one send of the outbound queue and drop what was accepted.
    ///
    /// Returns the bytes that left the queue, or `None` when nothing was
    /// queued or the socket would block. Whatever was not accepted stays
    /// queued for the next write readiness.
    pub fn write_once(&mut self) -> io::Result<Option<Bytes>> {
        if self.outbound.is_empty() {
            return Ok(None);
        }
        match self.stream.write(&self.outbound) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                let sent = self.outbound.split_to(n).freeze();
                self.advance_frames(n);
                Ok(Some(sent))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write a whole frame immediately when nothing is queued, queueing the
    /// unsent remainder. With output already queued the frame goes behind
    /// it so frames never interleave.
    pub fn send_now(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.has_pending_output() {
            self.enqueue(frame);
            return Ok(());
        }
        match self.stream.write(frame) {
            Ok(n) if n < frame.len() => {
                self.push_frame(None, frame, n);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(frame);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream accepting at most `chunk` bytes per write, with
    /// scripted reads and optional would-block responses.
    #[derive(Debug, Default)]
    pub(crate) struct MockStream {
        pub chunk: usize,
        pub written: Vec<u8>,
        pub reads: VecDeque<io::Result<Vec<u8>>>,
        pub block_writes: usize,
        pub fail_writes: bool,
    }

    impl MockStream {
        pub(crate) fn accepting(chunk: usize) -> Self {
            Self {
                chunk,
                ..Self::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            if self.block_writes > 0 {
                self.block_writes -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_partial_writes_preserve_bytes() {
        let mut conn = Connection::new(MockStream::accepting(3), 1, peer(), 64);
        let frames = ["[0/0] PONG (1)\n", "[1] keepalive\n", "[2/1] PONG (1)\n"];
        for frame in frames {
            conn.enqueue(frame.as_bytes());
        }
        let total = conn.pending_output();

        let mut sent = 0;
        let mut calls = 0;
        while let Some(bytes) = conn.write_once().unwrap() {
            assert!(bytes.len() <= 3);
            sent += bytes.len();
            calls += 1;
        }

        assert_eq!(sent, total);
        assert_eq!(calls, total.div_ceil(3));
        assert_eq!(conn.stream.written, frames.concat().into_bytes());
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn test_each_reply_flushed_once_in_order() {
        let mut conn = Connection::new(MockStream::accepting(20), 1, peer(), 64);
        let at = Local::now();
        conn.enqueue_reply(at, "[0] PING".to_string(), b"[0/0] PONG (1)\n");
        conn.enqueue_reply(at, "[1] PING".to_string(), b"[0/1] PONG (1)\n");

        // The first send carries all of reply 0 and part of reply 1.
        assert_eq!(conn.write_once().unwrap().unwrap().len(), 20);
        let flushed = conn.take_flushed();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].request, Some((at, "[0] PING".to_string())));
        assert_eq!(flushed[0].payload, "[0/0] PONG (1)");

        assert_eq!(conn.write_once().unwrap().unwrap().len(), 10);
        let flushed = conn.take_flushed();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].request, Some((at, "[1] PING".to_string())));
        assert_eq!(flushed[0].payload, "[0/1] PONG (1)");
        assert!(conn.take_flushed().is_empty());
    }

    #[test]
    fn test_coalesced_send_flushes_every_frame() {
        let mut conn = Connection::new(MockStream::accepting(1024), 1, peer(), 64);
        conn.enqueue_reply(Local::now(), "[4] PING".to_string(), b"[2/4] PONG (1)\n");
        conn.enqueue(b"[2] keepalive\n");

        assert!(conn.write_once().unwrap().is_some());
        let flushed = conn.take_flushed();
        let payloads: Vec<&str> = flushed.iter().map(|f| f.payload.as_str()).collect();
        assert_eq!(payloads, ["[2/4] PONG (1)", "[2] keepalive"]);
        assert!(flushed[1].request.is_none());
    }

    #[test]
    fn test_send_now_remainder_flushed_as_whole_frame() {
        let mut conn = Connection::new(MockStream::accepting(4), 1, peer(), 64);
        conn.send_now(b"[0] keepalive\n").unwrap();
        while conn.write_once().unwrap().is_some() {}
        let flushed = conn.take_flushed();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].payload, "[0] keepalive");
    }

    #[test]
    fn test_would_block_keeps_queue() {
        let mut stream = MockStream::accepting(100);
        stream.block_writes = 1;
        let mut conn = Connection::new(stream, 1, peer(), 64);
        conn.enqueue(b"[0/0] PONG (1)\n");

        assert_eq!(conn.write_once().unwrap(), None);
        assert_eq!(conn.pending_output(), 15);
        assert_eq!(conn.write_once().unwrap().unwrap().len(), 15);
        assert_eq!(conn.write_once().unwrap(), None);
    }

    #[test]
    fn test_send_now_queues_behind_pending_output() {
        let mut conn = Connection::new(MockStream::accepting(4), 1, peer(), 64);
        conn.send_now(b"[0] keepalive\n").unwrap();
        // Only four bytes went out, the rest is queued.
        assert_eq!(conn.stream.written, b"[0] ");
        conn.send_now(b"[1] keepalive\n").unwrap();
        assert_eq!(conn.stream.written, b"[0] ");

        while conn.write_once().unwrap().is_some() {}
        assert_eq!(conn.stream.written, b"[0] keepalive\n[1] keepalive\n");
    }

    #[test]
    fn test_read_events() {
        let mut stream = MockStream::accepting(8);
        stream.reads.push_back(Ok(b"[3] PING".to_vec()));
        stream.reads.push_back(Ok(Vec::new()));
        stream
            .reads
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        let mut conn = Connection::new(stream, 1, peer(), 4);

        // Bounded by the scratch buffer.
        assert_eq!(conn.read_once().unwrap(), ReadEvent::Data(4));
        assert_eq!(conn.inbound(4), b"[3] ");
        assert_eq!(conn.read_once().unwrap(), ReadEvent::Closed);
        assert_eq!(
            conn.read_once().unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(conn.read_once().unwrap(), ReadEvent::WouldBlock);
    }

    #[test]
    fn test_write_error_surfaces() {
        let mut stream = MockStream::accepting(8);
        stream.fail_writes = true;
        let mut conn = Connection::new(stream, 1, peer(), 4);
        conn.enqueue(b"x");
        assert!(conn.write_once().is_err());
        assert!(conn.send_now(b"y").is_ok());
    }
}
