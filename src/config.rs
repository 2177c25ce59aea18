//! Configuration for the hookline service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_delivery::{
    client::{ClientConfig, DEFAULT_USER_AGENT},
    notify::DEFAULT_CHANNEL,
    TriggerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";
const ENV_PREFIX: &str = "HOOKLINE_";

/// Service configuration layered from defaults, `hookline.toml` and
/// `HOOKLINE_*` environment variables (highest priority).
///
/// Every field name maps to an environment variable by upper-casing it and
/// adding the prefix, e.g. `worker_count` is `HOOKLINE_WORKER_COUNT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum pool connections.
    pub database_max_connections: u32,
    /// Minimum idle pool connections.
    pub database_min_connections: u32,
    /// Pool acquire timeout in seconds.
    pub database_connection_timeout: u64,
    /// Idle connection timeout in seconds.
    pub database_idle_timeout: u64,
    /// Maximum connection lifetime in seconds.
    pub database_max_lifetime: u64,

    // Health server
    /// Health server bind host.
    pub host: String,
    /// Health server bind port.
    pub port: u16,

    // Engine
    /// Concurrent delivery workers; non-positive means the default.
    pub worker_count: i64,
    /// Capacity of the webhook-id work queue.
    pub queue_capacity: usize,
    /// Events fetched per webhook batch.
    pub batch_size: usize,
    /// Seconds between backlog scans.
    pub backlog_interval_seconds: u64,
    /// Webhooks re-enqueued per backlog scan.
    pub backlog_batch_size: usize,
    /// Seconds between retention cleanups.
    pub cleanup_interval_seconds: u64,
    /// Days processed events are kept.
    pub retention_days: u64,
    /// Deliveries per destination per minute.
    pub rate_limit_per_minute: i64,
    /// Seconds a rate-limited event is pushed back.
    pub rate_limit_delay_seconds: u64,
    /// User-Agent sent with every delivery.
    pub user_agent: String,
    /// Skip SSRF checks. Never enable in production.
    pub allow_private_destinations: bool,
    /// Treat unsafe or invalid destinations as terminal failures.
    pub fail_fast_on_unsafe_destination: bool,
    /// `LISTEN` channel carrying webhook ids.
    pub notification_channel: String,
    /// Seconds allowed for a graceful stop.
    pub shutdown_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        let engine = TriggerConfig::default();
        Self {
            database_url: "postgresql://localhost/hookline".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_connection_timeout: 10,
            database_idle_timeout: 600,
            database_max_lifetime: 1800,
            host: "127.0.0.1".to_string(),
            port: 8080,
            worker_count: engine.worker_count,
            queue_capacity: engine.queue_capacity,
            batch_size: engine.batch_size,
            backlog_interval_seconds: engine.backlog_interval.as_secs(),
            backlog_batch_size: engine.backlog_batch_size,
            cleanup_interval_seconds: engine.cleanup_interval.as_secs(),
            retention_days: 7,
            rate_limit_per_minute: engine.rate_limit_per_minute,
            rate_limit_delay_seconds: engine.rate_limit_delay.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allow_private_destinations: false,
            fail_fast_on_unsafe_destination: false,
            notification_channel: DEFAULT_CHANNEL.to_string(),
            shutdown_timeout_seconds: engine.shutdown_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Loads and validates the layered configuration.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine configuration derived from these settings.
    pub fn trigger_config(&self) -> TriggerConfig {
        let defaults = TriggerConfig::default();
        TriggerConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            backlog_interval: Duration::from_secs(self.backlog_interval_seconds),
            backlog_batch_size: self.backlog_batch_size,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_seconds),
            retention: Duration::from_secs(self.retention_days.saturating_mul(24 * 3600)),
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_delay: Duration::from_secs(self.rate_limit_delay_seconds),
            client: ClientConfig { user_agent: self.user_agent.clone(), ..ClientConfig::default() },
            allow_private_destinations: self.allow_private_destinations,
            fail_fast_on_unsafe_destination: self.fail_fast_on_unsafe_destination,
            shutdown_timeout: self.shutdown_timeout(),
            ..defaults
        }
    }

    /// Graceful stop budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Health server bind address.
    pub fn health_addr(&self) -> Result<SocketAddr> {
        SocketAddr::from_str(&format!("{}:{}", self.host, self.port))
            .context("invalid health server address")
    }

    /// Database URL with the password replaced for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // "postgresql://host" has its only colon before the slashes.
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("database_url must not be empty");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.backlog_interval_seconds == 0 {
            anyhow::bail!("backlog_interval_seconds must be greater than 0");
        }
        if self.backlog_batch_size == 0 {
            anyhow::bail!("backlog_batch_size must be greater than 0");
        }
        if self.cleanup_interval_seconds == 0 {
            anyhow::bail!("cleanup_interval_seconds must be greater than 0");
        }
        if self.retention_days == 0 {
            anyhow::bail!("retention_days must be greater than 0");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }
        if !is_valid_channel(&self.notification_channel) {
            anyhow::bail!(
                "notification_channel must be a plain identifier, got {:?}",
                self.notification_channel
            );
        }
        Ok(())
    }
}

fn is_valid_channel(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
