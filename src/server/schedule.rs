//! Deadline-ordered timers of the event loop.
//!
//! Delayed replies and keepalive rounds are parked here instead of
//! sleeping, so readiness for other connections keeps being serviced
//! while they wait.

use chrono::{DateTime, Local};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Instant;

/// Work to resume once its deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// Queue the reply to request `seq` on the connection at slab key `conn`.
    Reply {
        conn: usize,
        /// Guards against the slab key having been reused.
        client_id: u32,
        seq: u64,
        request_at: DateTime<Local>,
        request: String,
    },
    /// Run a keepalive broadcast round.
    Keepalive,
}

#[derive(Debug)]
struct Entry {
    due: Instant,
    /// Insertion order, so equal deadlines fire first-in first-out.
    order: u64,
    timer: Timer,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.order).cmp(&(other.due, other.order))
    }
}

#[derive(Debug, Default)]
pub struct Schedule {
    heap: BinaryHeap<Reverse<Entry>>,
    inserted: u64,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, due: Instant, timer: Timer) {
        let order = self.inserted;
        self.inserted += 1;
        self.heap.push(Reverse(Entry { due, order, timer }));
    }

    /// Earliest pending deadline.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Timer> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.due <= now => {
                self.heap.pop().map(|Reverse(entry)| entry.timer)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reply(seq: u64) -> Timer {
        Timer::Reply {
            conn: 0,
            client_id: 1,
            seq,
            request_at: Local::now(),
            request: format!("[{seq}] PING"),
        }
    }

    fn seq_of(timer: Option<Timer>) -> Option<u64> {
        match timer {
            Some(Timer::Reply { seq, .. }) => Some(seq),
            _ => None,
        }
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let mut schedule = Schedule::new();
        let now = Instant::now();
        schedule.push(now + Duration::from_millis(30), reply(3));
        schedule.push(now + Duration::from_millis(10), reply(1));
        schedule.push(now + Duration::from_millis(20), reply(2));

        assert_eq!(schedule.next_due(), Some(now + Duration::from_millis(10)));
        let later = now + Duration::from_secs(1);
        assert_eq!(seq_of(schedule.pop_due(later)), Some(1));
        assert_eq!(seq_of(schedule.pop_due(later)), Some(2));
        assert_eq!(seq_of(schedule.pop_due(later)), Some(3));
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_nothing_due_yet() {
        let mut schedule = Schedule::new();
        let now = Instant::now();
        schedule.push(now + Duration::from_secs(5), Timer::Keepalive);
        assert_eq!(schedule.pop_due(now), None);
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn test_equal_deadlines_fifo() {
        let mut schedule = Schedule::new();
        let now = Instant::now();
        for seq in 0..5 {
            schedule.push(now, reply(seq));
        }
        for seq in 0..5 {
            assert_eq!(seq_of(schedule.pop_due(now)), Some(seq));
        }
    }
}
