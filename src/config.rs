//! Configuration module for pingmux.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments (or their environment variables) take
//! precedence over config file values, which take precedence over defaults.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pingmux")]
#[command(author = "pingmux authors")]
#[command(version = "0.1.0")]
#[command(about = "Round-trip latency probe over a persistent TCP link", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host the server binds to and agents connect to
    #[arg(long, env = "PINGMUX_HOST", global = true)]
    pub host: Option<String>,

    /// TCP port of the server
    #[arg(short, long, env = "PINGMUX_PORT", global = true)]
    pub port: Option<u16>,

    /// Session lifetime in seconds
    #[arg(long, env = "PINGMUX_LIFETIME", global = true)]
    pub lifetime: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Directory for per-component telemetry files (server.log, client<N>.log)
    #[arg(long, global = true)]
    pub telemetry_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Which side(s) of the link to run
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the connection multiplexer and keepalive broadcaster
    Server,
    /// Run a single polling agent
    Client,
    /// Run one server and several agents in this process
    Run {
        /// Number of polling agents
        #[arg(short = 'n', long, default_value_t = 2)]
        clients: usize,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint and lifetime shared by both sides
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            lifetime_secs: default_lifetime_secs(),
        }
    }
}

/// Multiplexer tunables
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Probability that a request is silently discarded
    #[serde(default = "default_drop_probability")]
    pub drop_probability: f64,
    #[serde(default = "default_reply_delay_min_ms")]
    pub reply_delay_min_ms: u64,
    #[serde(default = "default_reply_delay_max_ms")]
    pub reply_delay_max_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Upper bound of a single read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drop_probability: default_drop_probability(),
            reply_delay_min_ms: default_reply_delay_min_ms(),
            reply_delay_max_ms: default_reply_delay_max_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
            events_capacity: default_events_capacity(),
        }
    }
}

impl ServerConfig {
    pub fn reply_delay_ms(&self) -> RangeInclusive<u64> {
        self.reply_delay_min_ms..=self.reply_delay_max_ms
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Polling agent tunables
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Capacity of the in-flight ring window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_pause_min_ms")]
    pub pause_min_ms: u64,
    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            pause_min_ms: default_pause_min_ms(),
            pause_max_ms: default_pause_max_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl ClientConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn pause_ms(&self) -> RangeInclusive<u64> {
        self.pause_min_ms..=self.pause_max_ms
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Telemetry file directory
    pub telemetry_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            telemetry_dir: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    65432
}

fn default_lifetime_secs() -> u64 {
    60
}

fn default_drop_probability() -> f64 {
    0.1
}

fn default_reply_delay_min_ms() -> u64 {
    100
}

fn default_reply_delay_max_ms() -> u64 {
    1000
}

fn default_keepalive_interval_ms() -> u64 {
    5000
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_window_size() -> usize {
    10
}

fn default_connect_retries() -> u32 {
    3
}

fn default_connect_backoff_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_pause_min_ms() -> u64 {
    300
}

fn default_pause_max_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the link lives and how long it lasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub lifetime: Duration,
}

impl SessionConfig {
    /// `host:port` as passed to bind/connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            lifetime: Duration::from_secs(default_lifetime_secs()),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub session: SessionConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub log_level: String,
    pub telemetry_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            command: cli.command,
            session: SessionConfig {
                host: cli.host.unwrap_or(toml_config.session.host),
                port: cli.port.unwrap_or(toml_config.session.port),
                lifetime: Duration::from_secs(
                    cli.lifetime.unwrap_or(toml_config.session.lifetime_secs),
                ),
            },
            server: toml_config.server,
            client: toml_config.client,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            telemetry_dir: cli.telemetry_dir.or(toml_config.logging.telemetry_dir),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        if !(0.0..=1.0).contains(&server.drop_probability) {
            return Err(ConfigError::Invalid(format!(
                "server.drop_probability must be within [0, 1], got {}",
                server.drop_probability
            )));
        }
        if server.reply_delay_min_ms > server.reply_delay_max_ms {
            return Err(ConfigError::Invalid(
                "server.reply_delay_min_ms exceeds reply_delay_max_ms".to_string(),
            ));
        }
        if server.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if server.read_buffer_size == 0 || self.client.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be positive".to_string(),
            ));
        }
        if self.client.window_size == 0 {
            return Err(ConfigError::Invalid(
                "client.window_size must be at least 1".to_string(),
            ));
        }
        if self.client.pause_min_ms > self.client.pause_max_ms {
            return Err(ConfigError::Invalid(
                "client.pause_min_ms exceeds pause_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
