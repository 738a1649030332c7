use std::time::Duration;

use anyhow::Result;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};
use serde::Deserialize;

use crate::agents::RegistryConfig;
use crate::broker::BrokerConfig;
use crate::protocol::ServerSettings;

/// Upper bound for exponential retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub worker_threads: usize,
    pub queue_capacity: usize,
    pub message_ttl_secs: u64,
    pub dead_letter_ttl_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_message_size: usize,
    pub message_timeout_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    pub enable_persistence: bool,
    pub enable_metrics: bool,
    pub metrics_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub redis_url: String,
    pub log_level: String,
}

impl Config {
    /// Reads `.env`, then layers `A2A_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::with_environment(Environment::with_prefix("A2A").try_parsing(true))
    }

    fn with_environment(environment: Environment) -> Result<Self> {
        let config = Self::defaults()?.add_source(environment).build()?;
        Ok(config.try_deserialize()?)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 10000_i64)?
            .set_default("server_name", "ghost-a2a-broker")?
            .set_default("worker_threads", 4_i64)?
            .set_default("queue_capacity", 10_000_i64)?
            .set_default("message_ttl_secs", 3_600_i64)?
            .set_default("dead_letter_ttl_secs", 604_800_i64)?
            .set_default("max_retries", 3_i64)?
            .set_default("retry_delay_ms", 1_000_i64)?
            .set_default("max_message_size", 1_048_576_i64)?
            .set_default("message_timeout_secs", 30_i64)?
            .set_default("expiry_sweep_interval_secs", 10_i64)?
            .set_default("enable_persistence", true)?
            .set_default("enable_metrics", true)?
            .set_default("metrics_interval_secs", 30_i64)?
            .set_default("heartbeat_interval_secs", 60_i64)?
            .set_default("heartbeat_timeout_secs", 300_i64)?
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("log_level", "info")?;
        Ok(builder)
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            worker_threads: self.worker_threads.max(1),
            queue_capacity: self.queue_capacity.max(1),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retry_delay: MAX_RETRY_DELAY,
            max_message_size: self.max_message_size,
            message_timeout: Duration::from_secs(self.message_timeout_secs),
            message_ttl: Duration::from_secs(self.message_ttl_secs),
            dead_letter_ttl: Duration::from_secs(self.dead_letter_ttl_secs),
            expiry_sweep_interval: Duration::from_secs(self.expiry_sweep_interval_secs.max(1)),
            enable_metrics: self.enable_metrics,
            metrics_interval: Duration::from_secs(self.metrics_interval_secs.max(1)),
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            server_name: self.server_name.clone(),
            broker: self.broker(),
            registry: self.registry(),
        }
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }
}
