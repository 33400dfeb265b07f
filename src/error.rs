//! Error types for pingmux.

use crate::config::ConfigError;
use std::net::SocketAddr;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Wire protocol violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Chunk does not have the `[<seq>] PING` shape
    #[error("malformed request: {0:?}")]
    MalformedRequest(String),

    /// Line is neither a keepalive nor a `[<answer>/<seq>] PONG (<id>)` reply
    #[error("malformed reply: {0:?}")]
    MalformedReply(String),

    /// Handshake did not start with an ASCII-decimal client id
    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),
}

/// pingmux error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Peer sent bytes that do not follow the wire protocol
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Listening endpoint could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Underlying cause
        source: std::io::Error,
    },

    /// Connect retry budget exhausted
    #[error("connection to {addr} failed after {attempts} attempts")]
    ConnectFailed {
        /// Server address
        addr: String,
        /// Attempts made
        attempts: u32,
    },

    /// Server closed or stalled before sending the client id
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// host:port did not resolve to a socket address
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
