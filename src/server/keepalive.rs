//! Keepalive broadcast rounds.

use super::connection::Connection;
use super::AnswerCounter;
use crate::protocol;
use slab::Slab;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one broadcast round.
#[derive(Debug)]
pub struct BroadcastRound {
    /// Answer counter value carried by the frame.
    pub answer: u64,
    pub delivered: usize,
    /// Slab keys whose socket failed, with the error.
    pub failed: Vec<(usize, io::Error)>,
}

/// Sends `[<answer>] keepalive` to every live connection each interval.
#[derive(Debug, Clone, Copy)]
pub struct Broadcaster {
    interval: Duration,
}

impl Broadcaster {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Send one keepalive to every connection, then advance the answer
    /// counter once for the whole round.
    ///
    /// A failing connection does not stop delivery to the others; it is
    /// reported back for the multiplexer to close.
    pub fn broadcast<S: Read + Write>(
        &self,
        connections: &mut Slab<Connection<S>>,
        answers: &mut AnswerCounter,
    ) -> BroadcastRound {
        let answer = answers.current();
        let frame = protocol::encode_keepalive(answer);
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (key, conn) in connections.iter_mut() {
            match conn.send_now(frame.as_bytes()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(client_id = conn.client_id, peer = %conn.peer, error = %e, "Keepalive failed");
                    failed.push((key, e));
                }
            }
        }
        answers.advance();

        debug!(answer, delivered, failed = failed.len(), "Keepalive round");
        BroadcastRound {
            answer,
            delivered,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::tests::{peer, MockStream};

    fn connections(n: u32) -> Slab<Connection<MockStream>> {
        let mut slab = Slab::new();
        for id in 1..=n {
            slab.insert(Connection::new(MockStream::accepting(1024), id, peer(), 64));
        }
        slab
    }

    #[test]
    fn test_round_increments_counter_once() {
        let broadcaster = Broadcaster::new(Duration::from_secs(5));
        let mut slab = connections(2);
        let mut answers = AnswerCounter::default();

        let round = broadcaster.broadcast(&mut slab, &mut answers);
        assert_eq!(round.answer, 0);
        assert_eq!(round.delivered, 2);
        assert_eq!(answers.current(), 1);

        for (_, conn) in slab.iter() {
            assert_eq!(conn.stream.written, b"[0] keepalive\n");
        }
    }

    #[test]
    fn test_empty_round_still_counts() {
        let broadcaster = Broadcaster::new(Duration::from_secs(5));
        let mut slab = connections(0);
        let mut answers = AnswerCounter::default();

        let round = broadcaster.broadcast(&mut slab, &mut answers);
        assert_eq!(round.delivered, 0);
        assert_eq!(answers.current(), 1);
    }

    #[test]
    fn test_failure_does_not_block_others() {
        let broadcaster = Broadcaster::new(Duration::from_secs(5));
        let mut slab = connections(3);
        slab[1].stream.fail_writes = true;
        let mut answers = AnswerCounter::default();

        let round = broadcaster.broadcast(&mut slab, &mut answers);
        assert_eq!(round.delivered, 2);
        assert_eq!(round.failed.len(), 1);
        assert_eq!(round.failed[0].0, 1);
        assert_eq!(slab[0].stream.written, b"[0] keepalive\n");
        assert_eq!(slab[2].stream.written, b"[0] keepalive\n");
        assert_eq!(answers.current(), 1);
    }
}
