//! Runs one server and several polling agents in a single process.
//!
//! The server gets its own thread; agents run as independent tasks on a
//! tokio runtime. Nothing is shared between them except the TCP link, and
//! the failure of one agent never stops the others.

use crate::client;
use crate::config::Config;
use crate::error::Result;
use crate::jitter::RandomFaults;
use crate::server;
use crate::telemetry;
use std::thread;
use tracing::{error, info};

/// Start the server, then `clients` agents, and wait for all of them.
pub fn run(config: &Config, clients: usize) -> Result<()> {
    let server_thread = {
        let session = config.session.clone();
        let server_config = config.server.clone();
        let sink = telemetry::server_sink(config.telemetry_dir.as_deref())?;
        let faults = RandomFaults::new(server_config.drop_probability, server_config.reply_delay_ms());
        thread::Builder::new()
            .name("server".to_string())
            .spawn(move || server::run(&session, &server_config, faults, sink))?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut agents = Vec::with_capacity(clients);
        for n in 0..clients {
            let sink = telemetry::client_sink(config.telemetry_dir.as_deref());
            let task = client::run(config.session.clone(), config.client.clone(), sink);
            agents.push((n, tokio::spawn(task)));
        }

        for (n, agent) in agents {
            match agent.await {
                Ok(Ok(report)) => info!(
                    agent = n,
                    client_id = report.client_id,
                    issued = report.issued,
                    drained = report.drained,
                    reason = ?report.reason,
                    "Agent finished"
                ),
                Ok(Err(e)) => error!(agent = n, error = %e, "Agent failed"),
                Err(e) => error!(agent = n, error = %e, "Agent task panicked"),
            }
        }
    });

    match server_thread.join() {
        Ok(result) => result?,
        Err(_) => error!("Server thread panicked"),
    }
    info!("All components done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Command, ServerConfig, SessionConfig};
    use std::time::Duration;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_server_and_agents_exchange_pings() {
        let dir = std::env::temp_dir().join(format!("pingmux-supervisor-{}", std::process::id()));
        let config = Config {
            command: Command::Run { clients: 2 },
            session: SessionConfig {
                host: "127.0.0.1".to_string(),
                port: free_port(),
                lifetime: Duration::from_secs(1),
            },
            server: ServerConfig {
                drop_probability: 0.0,
                reply_delay_min_ms: 5,
                reply_delay_max_ms: 20,
                keepalive_interval_ms: 200,
                ..ServerConfig::default()
            },
            client: ClientConfig {
                connect_backoff_ms: 50,
                read_timeout_ms: 200,
                pause_min_ms: 20,
                pause_max_ms: 40,
                ..ClientConfig::default()
            },
            log_level: "info".to_string(),
            telemetry_dir: Some(dir.clone()),
        };

        run(&config, 2).unwrap();

        let server_log = std::fs::read_to_string(dir.join("server.log")).unwrap();
        assert!(server_log.contains("PONG (1)"));
        assert!(server_log.contains("PONG (2)"));
        for id in 1..=2 {
            let client_log = std::fs::read_to_string(dir.join(format!("client{id}.log"))).unwrap();
            assert!(client_log.contains(&format!("PONG ({id})")), "client{id}: {client_log}");
            assert!(client_log.contains("keepalive"), "client{id}: {client_log}");
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
