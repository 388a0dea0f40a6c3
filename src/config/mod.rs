use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::AppError;

const ENV_PREFIX: &str = "relay";

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

/// What the router does when a recipient's outbound queue is full.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Discard the frame for that recipient only.
    Drop,
    /// Treat the full queue as a failed send and close the recipient.
    Disconnect,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub send_timeout_ms: u64,
    pub max_message_size: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl RelayConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Longest a writer can take to exit: one in-flight frame, the close
    /// frame, then closing the sink, each bounded by the send timeout.
    pub fn writer_drain(&self) -> Duration {
        self.send_timeout() * 3
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    pub filter: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub log: LogConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", "development")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 3000)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("relay.outbound_capacity", 256)?
        .set_default("relay.overflow_policy", "drop")?
        .set_default("relay.send_timeout_ms", 5000)?
        .set_default("relay.max_message_size", 16 * 1024 * 1024)?
        .set_default("relay.heartbeat_interval_secs", 30)?
        .set_default("relay.heartbeat_timeout_secs", 40)?
        .set_default("relay.handshake_timeout_secs", 10)?
        .set_default("relay.shutdown_grace_ms", 16000)?
        .set_default("log.filter", "sensor_relay=info")
}

fn env_source(prefix: &str) -> Environment {
    // E.g., `RELAY_SERVER__PORT=4000` sets `Settings.server.port`
    Environment::with_prefix(prefix)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Settings {
    pub fn new() -> Result<Self, AppError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = with_defaults(Config::builder())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Loopback on an ephemeral port, short timers, no environment or file sources.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        with_defaults(Config::builder())?
            .set_override("environment", "test")?
            .set_override("server.host", "127.0.0.1")?
            .set_override("server.port", 0)?
            .set_override("server.workers", 2)?
            .set_override("relay.send_timeout_ms", 1000)?
            .set_override("relay.heartbeat_interval_secs", 0)?
            .build()?
            .try_deserialize()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.relay.outbound_capacity == 0 {
            return Err(AppError::ConfigError(
                "relay.outbound_capacity must be at least 1".to_string(),
            ));
        }
        if self.server.workers == 0 {
            return Err(AppError::ConfigError(
                "server.workers must be at least 1".to_string(),
            ));
        }
        if self.relay.heartbeat_interval_secs > 0
            && self.relay.heartbeat_timeout_secs <= self.relay.heartbeat_interval_secs
        {
            return Err(AppError::ConfigError(format!(
                "relay.heartbeat_timeout_secs ({}) must exceed relay.heartbeat_interval_secs ({})",
                self.relay.heartbeat_timeout_secs, self.relay.heartbeat_interval_secs
            )));
        }
        if self.relay.handshake_timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "relay.handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.relay.shutdown_grace() < self.relay.writer_drain() {
            return Err(AppError::ConfigError(format!(
                "relay.shutdown_grace_ms ({}) must be at least 3 x relay.send_timeout_ms ({})",
                self.relay.shutdown_grace_ms, self.relay.send_timeout_ms
            )));
        }
        Ok(())
    }
}
