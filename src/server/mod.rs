//! Server side of the link.
//!
//! One thread runs a [`Multiplexer`]: a mio readiness loop that accepts
//! connections, answers requests after a simulated delay (or loses them),
//! and runs keepalive rounds on a timer. Everything it shares between the
//! request path and the keepalive path (the connection slab and the
//! [`AnswerCounter`]) is owned by the multiplexer and touched only between
//! polls, so no locking is needed.

mod connection;
mod keepalive;
mod multiplexer;
mod schedule;

pub use connection::{Connection, QueuedFrame, ReadEvent};
pub use keepalive::{BroadcastRound, Broadcaster};
pub use multiplexer::Multiplexer;
pub use schedule::{Schedule, Timer};

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::jitter::FaultInjector;
use crate::session::SessionClock;
use crate::telemetry::TelemetrySink;
use std::net::{SocketAddr, ToSocketAddrs};

/// Orders everything the server sends.
///
/// Advanced once per send that moved bytes on the reply path and once per
/// keepalive round, independent of any client's request sequence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnswerCounter(u64);

impl AnswerCounter {
    pub fn current(&self) -> u64 {
        self.0
    }

    /// Increment and return the new value.
    pub fn advance(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

/// Resolve `host:port` to the first socket address it names.
pub fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))
}

/// Bind the configured endpoint and serve until the session lifetime ends.
pub fn run<F, S>(session: &SessionConfig, config: &ServerConfig, faults: F, sink: S) -> Result<()>
where
    F: FaultInjector,
    S: TelemetrySink,
{
    let addr = resolve(&session.address())?;
    let mut multiplexer = Multiplexer::bind(addr, config, faults, sink)?;
    let clock = SessionClock::start(session.lifetime);
    multiplexer.run(&clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_counter() {
        let mut answers = AnswerCounter::default();
        assert_eq!(answers.current(), 0);
        assert_eq!(answers.advance(), 1);
        assert_eq!(answers.advance(), 2);
        assert_eq!(answers.current(), 2);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:65432").unwrap(),
            "127.0.0.1:65432".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            resolve("not an address"),
            Err(Error::InvalidAddress(_))
        ));
    }
}
