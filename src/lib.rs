//! pingmux: round-trip latency probe over persistent TCP links.
//!
//! - `server`: single-threaded mio multiplexer that answers `[<seq>] PING`
//!   requests after a simulated delay, loses some of them on purpose, and
//!   broadcasts keepalives to every connection
//! - `client`: polling agents that pace requests and correlate replies
//!   through a fixed-size ring window, reporting lost ones as timeouts
//! - `supervisor`: runs one server and several agents in one process
//!
//! Every protocol event is reported as a structured telemetry record.

pub mod client;
pub mod config;
pub mod error;
pub mod jitter;
pub mod protocol;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub use error::{Error, Result};
