//! Request/response correlation over a fixed-capacity ring window.
//!
//! Requests are numbered from 0 and stored at `seq % window_size`. A reply
//! for sequence `s` resolves every older unanswered request as a timeout,
//! in increasing order, before acknowledging `s` itself. Whatever is still
//! unanswered when the session ends is drained the same way.
//!
//! The window is not guarded against overflow: when more than
//! `window_size` requests are unresolved, newer requests overwrite the
//! slots of older ones and the drained timeout records describe the
//! overwriting request. Callers are expected to keep the in-flight count
//! within the window.

use crate::error::ProtocolError;
use crate::protocol::{self, Inbound};
use crate::telemetry::{Outcome, Record, TelemetrySink};
use chrono::{DateTime, Local};
use tracing::{debug, warn};

/// A request waiting for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub seq: u64,
    pub issued_at: DateTime<Local>,
    pub payload: String,
}

/// How an inbound line was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Keepalive,
    /// Request `seq` acknowledged after `timed_out` older requests were drained.
    Acked { seq: u64, timed_out: u64 },
    /// Reply for a sequence already resolved.
    Stale { seq: u64 },
    /// Reply for a sequence never issued.
    Unknown { seq: u64 },
}

#[derive(Debug)]
pub struct Correlator {
    window: Vec<Option<PendingRequest>>,
    /// Next sequence to issue; equals the number of requests issued.
    issued: u64,
    /// Oldest unresolved sequence (last answered + 1).
    next_unanswered: u64,
}

impl Correlator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: vec![None; window_size.max(1)],
            issued: 0,
            next_unanswered: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    fn slot(&self, seq: u64) -> usize {
        (seq % self.window.len() as u64) as usize
    }

    /// Assign the next sequence number and remember the request.
    ///
    /// Returns the request payload to put on the wire.
    pub fn issue(&mut self, issued_at: DateTime<Local>) -> String {
        let seq = self.issued;
        let payload = protocol::encode_request(seq);
        let slot = self.slot(seq);
        self.window[slot] = Some(PendingRequest {
            seq,
            issued_at,
            payload: payload.clone(),
        });
        self.issued += 1;
        payload
    }

    /// Number of requests issued so far.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Highest sequence resolved so far, acknowledged or timed out.
    pub fn last_answered(&self) -> Option<u64> {
        self.next_unanswered.checked_sub(1)
    }

    /// Requests issued but not yet resolved.
    pub fn in_flight(&self) -> u64 {
        self.issued - self.next_unanswered
    }

    /// Slot content for `seq`, which may belong to a newer request.
    pub fn pending(&self, seq: u64) -> Option<&PendingRequest> {
        self.window[self.slot(seq)].as_ref()
    }

    /// Resolve one complete inbound line received at `at`.
    pub fn on_line<S: TelemetrySink + ?Sized>(
        &mut self,
        line: &str,
        at: DateTime<Local>,
        sink: &mut S,
    ) -> Result<Resolution, ProtocolError> {
        match protocol::classify(line)? {
            Inbound::Keepalive => {
                sink.record(Record::unsolicited(at, line));
                Ok(Resolution::Keepalive)
            }
            Inbound::Reply { seq } if seq < self.next_unanswered => {
                warn!(seq, last_answered = ?self.last_answered(), "Reply for an already resolved request");
                sink.record(Record::unsolicited(at, line));
                Ok(Resolution::Stale { seq })
            }
            Inbound::Reply { seq } if seq >= self.issued => {
                warn!(seq, issued = self.issued, "Reply for a request never issued");
                sink.record(Record::unsolicited(at, line));
                Ok(Resolution::Unknown { seq })
            }
            Inbound::Reply { seq } => {
                let timed_out = self.expire_before(seq, at, sink);
                let outcome = Outcome::Response(line.to_string());
                sink.record(self.resolved(seq, at, outcome));
                self.next_unanswered = seq + 1;
                debug!(seq, timed_out, "Reply acknowledged");
                Ok(Resolution::Acked { seq, timed_out })
            }
        }
    }

    /// Resolve every request still unanswered as a timeout.
    ///
    /// Returns the number of timeout records emitted; zero when nothing is
    /// in flight.
    pub fn drain<S: TelemetrySink + ?Sized>(&mut self, at: DateTime<Local>, sink: &mut S) -> u64 {
        self.expire_before(self.issued, at, sink)
    }

    fn expire_before<S: TelemetrySink + ?Sized>(
        &mut self,
        seq: u64,
        at: DateTime<Local>,
        sink: &mut S,
    ) -> u64 {
        let mut expired = 0;
        while self.next_unanswered != seq {
            sink.record(self.resolved(self.next_unanswered, at, Outcome::Timeout));
            self.next_unanswered += 1;
            expired += 1;
        }
        expired
    }

    fn resolved(&self, seq: u64, at: DateTime<Local>, outcome: Outcome) -> Record {
        match self.pending(seq) {
            Some(pending) => Record::answered(pending.issued_at, pending.payload.clone(), at, outcome),
            None => Record {
                request_at: None,
                request: None,
                response_at: at,
                outcome,
            },
        }
    }
}
