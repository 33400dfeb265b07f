//! Polling agent: one connection, timed requests, correlated replies.
//!
//! ```text
//! Disconnected -> Connecting -> Active -> Draining -> Closed
//!                     |                                 ^
//!                     +------- retries exhausted -------+
//! ```
//!
//! While `Active` the agent sends a request, waits a bounded time for
//! whatever the server sends back, hands every complete line to the
//! correlator and sleeps a paced interval. The session clock or a peer
//! abort moves it to `Draining`, where unresolved requests are reported as
//! timeouts before the socket is closed.

use crate::client::correlator::Correlator;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::jitter::Pacer;
use crate::protocol::{self, FrameBuffer};
use crate::session::SessionClock;
use crate::telemetry::TelemetrySink;
use chrono::Local;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// An unterminated line may span at most this many reads.
const MAX_LINE_READS: usize = 4;

/// Lifecycle of a polling agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting { attempt: u32 },
    Active { client_id: u32 },
    Draining { reason: DrainReason },
    Closed,
}

/// Why the agent stopped issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// Session clock expired.
    TimeUp,
    /// Server closed the connection.
    PeerClosed,
    /// Connection reset or otherwise failed.
    Aborted,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReport {
    pub client_id: u32,
    pub issued: u64,
    /// Timeouts emitted by the end-of-session drain.
    pub drained: u64,
    pub reason: DrainReason,
}

/// What one bounded read produced.
enum Received {
    Nothing,
    Frames { replies: usize },
}

pub struct PollingAgent<S, P> {
    address: String,
    lifetime: Duration,
    config: ClientConfig,
    sink: S,
    pacer: P,
    state: AgentState,
    correlator: Correlator,
    frames: FrameBuffer,
    read_buf: Vec<u8>,
}

impl<S: TelemetrySink, P: Pacer> PollingAgent<S, P> {
    pub fn new(
        address: impl Into<String>,
        lifetime: Duration,
        config: &ClientConfig,
        sink: S,
        pacer: P,
    ) -> Self {
        Self {
            address: address.into(),
            lifetime,
            config: config.clone(),
            sink,
            pacer,
            state: AgentState::Disconnected,
            correlator: Correlator::new(config.window_size),
            frames: FrameBuffer::with_limit(config.read_buffer_size * MAX_LINE_READS),
            read_buf: vec![0u8; config.read_buffer_size],
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    fn transition(&mut self, next: AgentState) {
        debug!(from = ?self.state, to = ?next, "Agent state change");
        self.state = next;
    }

    /// Connect, run the session until the clock expires or the server goes
    /// away, then drain and close.
    pub async fn run(&mut self) -> Result<AgentReport> {
        let (stream, client_id) = match self.connect().await {
            Ok(connected) => connected,
            Err(e) => {
                error!(address = %self.address, error = %e, "Connection to server failed");
                self.transition(AgentState::Closed);
                return Err(e);
            }
        };
        Ok(self.serve(stream, client_id).await)
    }

    /// Run the session over an already established stream.
    pub async fn run_on<T>(&mut self, mut stream: T) -> Result<AgentReport>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(AgentState::Connecting { attempt: 1 });
        match self.handshake(&mut stream).await {
            Ok(client_id) => Ok(self.serve(stream, client_id).await),
            Err(e) => {
                self.transition(AgentState::Closed);
                Err(e)
            }
        }
    }

    async fn connect(&mut self) -> Result<(TcpStream, u32)> {
        let attempts = self.config.connect_retries.max(1);
        for attempt in 1..=attempts {
            self.transition(AgentState::Connecting { attempt });
            let result = match TcpStream::connect(&self.address).await {
                Ok(mut stream) => {
                    let handshake = self.handshake(&mut stream).await;
                    handshake.map(|client_id| (stream, client_id))
                }
                Err(e) => Err(Error::Io(e)),
            };
            match result {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    warn!(address = %self.address, attempt, error = %e, "Connect attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_backoff()).await;
                    }
                }
            }
        }
        Err(Error::ConnectFailed {
            addr: self.address.clone(),
            attempts,
        })
    }

    /// Read the client id the server sends right after accepting.
    async fn handshake<T>(&mut self, stream: &mut T) -> Result<u32>
    where
        T: AsyncRead + Unpin,
    {
        let n = match timeout(self.config.read_timeout(), stream.read(&mut self.read_buf)).await {
            Err(_) => return Err(Error::Handshake("timed out waiting for client id".to_string())),
            Ok(Ok(0)) => return Err(Error::Handshake("connection closed".to_string())),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Io(e)),
        };
        let (client_id, rest) = protocol::parse_handshake(&self.read_buf[..n])?;
        let rest = rest.to_vec();
        self.sink.attach(client_id);
        info!(client_id, address = %self.address, "Connected to server");
        if !rest.is_empty() {
            self.process(&rest);
        }
        Ok(client_id)
    }

    async fn serve<T>(&mut self, mut stream: T, client_id: u32) -> AgentReport
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.transition(AgentState::Active { client_id });
        let reason = self.active(&mut stream, client_id).await;

        self.transition(AgentState::Draining { reason });
        let drained = self.correlator.drain(Local::now(), &mut self.sink);
        if let Err(e) = stream.shutdown().await {
            debug!(client_id, error = %e, "Shutdown after drain failed");
        }
        drop(stream);
        info!(client_id, drained, "Connection closed");
        self.transition(AgentState::Closed);

        AgentReport {
            client_id,
            issued: self.correlator.issued(),
            drained,
            reason,
        }
    }

    async fn active<T>(&mut self, stream: &mut T, client_id: u32) -> DrainReason
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let clock = SessionClock::start(self.lifetime);
        info!(client_id, lifetime_secs = self.lifetime.as_secs_f64(), "Starting pinging");

        loop {
            if clock.expired() {
                info!(client_id, "Time is up");
                return DrainReason::TimeUp;
            }

            let request = self.correlator.issue(Local::now());
            if let Err(e) = stream.write_all(request.as_bytes()).await {
                return aborted(client_id, &e);
            }

            if let Err(reason) = self.receive(stream, client_id).await {
                return reason;
            }

            tokio::time::sleep(self.pacer.pause()).await;
        }
    }

    /// Wait for the reply to the request just sent. A read that only
    /// brought keepalives is followed by one more bounded read.
    async fn receive<T>(&mut self, stream: &mut T, client_id: u32) -> std::result::Result<(), DrainReason>
    where
        T: AsyncRead + Unpin,
    {
        match self.read_once(stream, client_id).await? {
            Received::Frames { replies: 0 } => {
                self.read_once(stream, client_id).await?;
            }
            Received::Frames { .. } | Received::Nothing => {}
        }
        Ok(())
    }

    async fn read_once<T>(
        &mut self,
        stream: &mut T,
        client_id: u32,
    ) -> std::result::Result<Received, DrainReason>
    where
        T: AsyncRead + Unpin,
    {
        match timeout(self.config.read_timeout(), stream.read(&mut self.read_buf)).await {
            Err(_) => Ok(Received::Nothing),
            Ok(Ok(0)) => {
                warn!(client_id, "Connection closed by server");
                Err(DrainReason::PeerClosed)
            }
            Ok(Ok(n)) => {
                let chunk = self.read_buf[..n].to_vec();
                Ok(Received::Frames {
                    replies: self.process(&chunk),
                })
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(Received::Nothing),
            Ok(Err(e)) => Err(aborted(client_id, &e)),
        }
    }

    /// Feed a chunk to the framer and every complete line to the correlator.
    /// Returns how many lines were not keepalives.
    fn process(&mut self, chunk: &[u8]) -> usize {
        let at = Local::now();
        let mut replies = 0;
        for line in self.frames.push(chunk) {
            if !protocol::is_keepalive(&line) {
                replies += 1;
            }
            if let Err(e) = self.correlator.on_line(&line, at, &mut self.sink) {
                warn!(error = %e, "Discarding unparseable frame");
            }
        }
        replies
    }
}

fn aborted(client_id: u32, e: &io::Error) -> DrainReason {
    warn!(client_id, error = %e, "Connection aborted by server");
    DrainReason::Aborted
}
