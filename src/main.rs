//! pingmux binary: run the server, a single agent, or both.

use pingmux::config::{Command, Config};
use pingmux::jitter::RandomFaults;
use pingmux::{client, server, supervisor, telemetry};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.session.host,
        port = config.session.port,
        lifetime_secs = config.session.lifetime.as_secs(),
        command = ?config.command,
        "Starting pingmux"
    );

    match config.command {
        Command::Server => run_server(&config),
        Command::Client => run_client(&config),
        Command::Run { clients } => {
            supervisor::run(&config, clients)?;
            Ok(())
        }
    }
}

/// Run the multiplexer until the session lifetime ends.
fn run_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let sink = telemetry::server_sink(config.telemetry_dir.as_deref())?;
    let faults = RandomFaults::new(
        config.server.drop_probability,
        config.server.reply_delay_ms(),
    );
    server::run(&config.session, &config.server, faults, sink)?;
    Ok(())
}

/// Run one polling agent on a single-threaded runtime.
fn run_client(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let sink = telemetry::client_sink(config.telemetry_dir.as_deref());
    let report = runtime.block_on(client::run(
        config.session.clone(),
        config.client.clone(),
        sink,
    ))?;
    info!(
        client_id = report.client_id,
        issued = report.issued,
        drained = report.drained,
        reason = ?report.reason,
        "Agent finished"
    );
    Ok(())
}
