//! Single-threaded readiness loop serving every connection.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform one bounded, non-blocking read or write. mio reports readiness
//! edges, so every connection is re-armed after it is serviced; this gives
//! level-triggered behaviour where a socket that still has data to read or
//! bytes to send is reported again on the next poll.
//!
//! Simulated reply latency and keepalive rounds never sleep. They are
//! parked in a [`Schedule`] and the poll timeout is bounded by the earliest
//! deadline, so other connections keep being serviced in the meantime.

use super::connection::{Connection, ReadEvent};
use super::keepalive::Broadcaster;
use super::schedule::{Schedule, Timer};
use super::AnswerCounter;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::jitter::FaultInjector;
use crate::protocol;
use crate::session::SessionClock;
use crate::telemetry::{Outcome, Record, TelemetrySink};
use chrono::{DateTime, Local};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Why a connection is being destroyed.
#[derive(Debug)]
enum CloseCause {
    /// Zero-byte read.
    PeerClosed,
    /// Reset or aborted by the peer.
    Reset(io::Error),
    /// Any other socket error.
    Failed(io::Error),
    /// Server is shutting down.
    Shutdown,
}

impl From<io::Error> for CloseCause {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => CloseCause::Reset(e),
            _ => CloseCause::Failed(e),
        }
    }
}

pub struct Multiplexer<F, S> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<Connection<TcpStream>>,
    answers: AnswerCounter,
    /// Next client id to hand out; ids start at 1 and are never reused.
    next_client_id: u32,
    schedule: Schedule,
    broadcaster: Broadcaster,
    faults: F,
    sink: S,
    read_buffer_size: usize,
}

impl<F: FaultInjector, S: TelemetrySink> Multiplexer<F, S> {
    /// Bind the listening endpoint and set up the poll registry.
    pub fn bind(addr: SocketAddr, config: &ServerConfig, faults: F, sink: S) -> Result<Self> {
        let poll = Poll::new()?;
        let listener = create_listener(addr).map_err(|source| Error::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            listener,
            local_addr,
            connections: Slab::new(),
            answers: AnswerCounter::default(),
            next_client_id: 1,
            schedule: Schedule::new(),
            broadcaster: Broadcaster::new(config.keepalive_interval()),
            faults,
            sink,
            read_buffer_size: config.read_buffer_size,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current value of the global answer counter.
    pub fn answers(&self) -> u64 {
        self.answers.current()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve until the session clock expires, then close every connection.
    ///
    /// The first keepalive round runs immediately.
    pub fn run(&mut self, clock: &SessionClock) -> Result<()> {
        info!(addr = %self.local_addr, "Starting listening");
        self.schedule.push(Instant::now(), Timer::Keepalive);

        while !clock.expired() {
            self.turn(clock, clock.remaining())?;
        }

        info!("Time is up");
        self.shutdown();
        Ok(())
    }

    /// One poll, the readiness it reports, then every timer that came due.
    /// Waits at most `max_wait`, less if a timer or the session ends sooner.
    pub fn turn(&mut self, clock: &SessionClock, max_wait: Duration) -> Result<()> {
        let timeout = self.poll_timeout(clock, max_wait);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let ready: Vec<Readiness> = self
            .events
            .iter()
            .map(|event| Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            })
            .collect();

        for readiness in ready {
            match readiness.token {
                LISTENER_TOKEN => self.accept(),
                Token(key) => self.service(key, readiness),
            }
        }

        self.fire_timers(clock);
        Ok(())
    }

    fn poll_timeout(&self, clock: &SessionClock, max_wait: Duration) -> Duration {
        let until = match self.schedule.next_due() {
            Some(due) => due.min(clock.deadline()),
            None => clock.deadline(),
        };
        until
            .saturating_duration_since(Instant::now())
            .min(max_wait)
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Register a freshly accepted socket and send it its client id.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let entry = self.connections.vacant_entry();
        let key = entry.key();
        let conn = entry.insert(Connection::new(stream, client_id, peer, self.read_buffer_size));
        let registered = self.poll.registry().register(
            &mut conn.stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        );
        if let Err(e) = registered {
            self.connections.remove(key);
            return Err(e);
        }

        info!(client_id, peer = %peer, "Accepted connection");
        let handshake = protocol::encode_handshake(client_id);
        if let Err(e) = self.connections[key].send_now(handshake.as_bytes()) {
            self.close(key, CloseCause::from(e));
        }
        Ok(())
    }

    fn service(&mut self, key: usize, readiness: Readiness) {
        if !self.connections.contains(key) {
            return;
        }

        if readiness.readable {
            if let Err(cause) = self.handle_readable(key) {
                self.close(key, cause);
                return;
            }
        }

        if readiness.writable {
            if let Err(cause) = self.handle_writable(key) {
                self.close(key, cause);
                return;
            }
        }

        self.rearm(key);
    }

    fn handle_readable(&mut self, key: usize) -> std::result::Result<(), CloseCause> {
        match self.connections[key].read_once()? {
            ReadEvent::Closed => Err(CloseCause::PeerClosed),
            ReadEvent::WouldBlock => Ok(()),
            ReadEvent::Data(n) => {
                let chunk = self.connections[key].inbound(n).to_vec();
                self.on_request(key, &chunk);
                Ok(())
            }
        }
    }

    /// Lose the request, or schedule its reply after a simulated delay.
    fn on_request(&mut self, key: usize, chunk: &[u8]) {
        let request_at = Local::now();
        let request = String::from_utf8_lossy(chunk).into_owned();
        let client_id = self.connections[key].client_id;

        if self.faults.drop_request() {
            debug!(client_id, request = %request, "Request ignored");
            self.sink.record(Record::answered(
                request_at,
                request,
                Local::now(),
                Outcome::Ignored,
            ));
            return;
        }

        match protocol::parse_request(chunk) {
            Ok(seq) => {
                let delay = self.faults.reply_delay();
                debug!(client_id, seq, delay_ms = delay.as_millis() as u64, "Reply scheduled");
                self.schedule.push(
                    Instant::now() + delay,
                    Timer::Reply {
                        conn: key,
                        client_id,
                        seq,
                        request_at,
                        request,
                    },
                );
            }
            Err(e) => warn!(client_id, error = %e, "Discarding malformed request"),
        }
    }

    /// One bounded send; the answer counter advances once per send that
    /// moved any bytes, however many frames those bytes hold. Every frame
    /// whose last byte left with this send gets its own record.
    fn handle_writable(&mut self, key: usize) -> std::result::Result<(), CloseCause> {
        let conn = &mut self.connections[key];
        let sent = match conn.write_once()? {
            Some(sent) => sent,
            None => return Ok(()),
        };
        let answer = self.answers.advance();
        let flushed = conn.take_flushed();
        let client_id = conn.client_id;

        let response_at = Local::now();
        debug!(client_id, answer, bytes = sent.len(), frames = flushed.len(), "Sent");
        for frame in flushed {
            let record = match frame.request {
                Some((request_at, request)) => Record::answered(
                    request_at,
                    request,
                    response_at,
                    Outcome::Response(frame.payload),
                ),
                None => Record::unsolicited(response_at, frame.payload),
            };
            self.sink.record(record);
        }
        Ok(())
    }

    /// Re-register with the interest matching the connection's queue.
    fn rearm(&mut self, key: usize) {
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        let interest = if conn.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let rearmed = self
            .poll
            .registry()
            .reregister(&mut conn.stream, Token(key), interest);
        if let Err(e) = rearmed {
            self.close(key, CloseCause::Failed(e));
        }
    }

    fn fire_timers(&mut self, clock: &SessionClock) {
        let now = Instant::now();
        while let Some(timer) = self.schedule.pop_due(now) {
            match timer {
                Timer::Reply {
                    conn,
                    client_id,
                    seq,
                    request_at,
                    request,
                } => self.queue_reply(conn, client_id, seq, request_at, request),
                Timer::Keepalive => {
                    if clock.expired() {
                        continue;
                    }
                    self.broadcast_keepalive();
                    self.schedule
                        .push(Instant::now() + self.broadcaster.interval(), Timer::Keepalive);
                }
            }
        }
    }

    /// Encode the reply with the counter value current now, when its delay
    /// has ended, and queue it. A keepalive round that runs before the send
    /// advances the counter without changing the queued frame.
    fn queue_reply(
        &mut self,
        key: usize,
        client_id: u32,
        seq: u64,
        request_at: DateTime<Local>,
        request: String,
    ) {
        let conn = match self.connections.get_mut(key) {
            Some(conn) if conn.client_id == client_id => conn,
            _ => {
                debug!(client_id, seq, "Connection gone, reply discarded");
                return;
            }
        };
        let frame = protocol::encode_reply(self.answers.current(), seq, client_id);
        conn.enqueue_reply(request_at, request, frame.as_bytes());
        self.rearm(key);
    }

    /// Run one keepalive round over every live connection.
    ///
    /// Returns how many connections the frame was delivered or queued to.
    pub fn broadcast_keepalive(&mut self) -> usize {
        let round = self
            .broadcaster
            .broadcast(&mut self.connections, &mut self.answers);
        for (key, e) in round.failed {
            self.close(key, CloseCause::from(e));
        }

        let backlogged: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.has_pending_output())
            .map(|(key, _)| key)
            .collect();
        for key in backlogged {
            self.rearm(key);
        }
        round.delivered
    }

    /// Deregister and drop a connection.
    fn close(&mut self, key: usize, cause: CloseCause) {
        let Some(mut conn) = self.connections.try_remove(key) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);

        let client_id = conn.client_id;
        let peer = conn.peer;
        match cause {
            CloseCause::PeerClosed => info!(client_id, peer = %peer, "Closing connection"),
            CloseCause::Reset(e) => {
                warn!(client_id, peer = %peer, error = %e, "Connection aborted by client")
            }
            CloseCause::Failed(e) => warn!(client_id, peer = %peer, error = %e, "Connection failed"),
            CloseCause::Shutdown => debug!(client_id, peer = %peer, "Closing connection on shutdown"),
        }
    }

    fn shutdown(&mut self) {
        info!(connections = self.connections.len(), "Shutting down the server");
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close(key, CloseCause::Shutdown);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
