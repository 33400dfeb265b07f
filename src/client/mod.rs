//! Client side of the link: polling agents and their response correlators.
//!
//! Each agent owns its socket, ring window and telemetry sink; agents share
//! nothing with each other.

mod agent;
mod correlator;

pub use agent::{AgentReport, AgentState, DrainReason, PollingAgent};
pub use correlator::{Correlator, PendingRequest, Resolution};

use crate::config::{ClientConfig, SessionConfig};
use crate::error::Result;
use crate::jitter::RandomPacer;
use crate::telemetry::TelemetrySink;

/// Run one agent with random pacing against the configured server.
pub async fn run<S: TelemetrySink>(
    session: SessionConfig,
    config: ClientConfig,
    sink: S,
) -> Result<AgentReport> {
    let pacer = RandomPacer::new(config.pause_ms());
    let mut agent = PollingAgent::new(session.address(), session.lifetime, &config, sink, pacer);
    agent.run().await
}
