use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::client_key::KeyStrategy;
use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::token_bucket::BucketSettings;

/// Service configuration, read from CLI flags or environment variables.
#[derive(Debug, Clone, Parser, Serialize)]
#[command(name = "turnstile", version, about)]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_address: SocketAddr,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Tokens in the bucket shared by all clients
    #[arg(long, env = "GLOBAL_BURST", default_value_t = 5)]
    pub global_burst: u32,

    /// Time to earn back one global token
    #[arg(long, env = "GLOBAL_REFILL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub global_refill_interval: Duration,

    /// Tokens in each client's bucket
    #[arg(long, env = "CLIENT_BURST", default_value_t = 5)]
    pub client_burst: u32,

    /// Time for a client to earn back one token
    #[arg(long, env = "CLIENT_REFILL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub client_refill_interval: Duration,

    /// How requests are attributed to clients
    #[arg(long, env = "KEY_STRATEGY", value_enum, default_value_t = KeyStrategy::RemoteIp)]
    pub key_strategy: KeyStrategy,

    /// Most clients tracked at once; 0 means unbounded
    #[arg(long, env = "MAX_CLIENTS", default_value_t = 100_000)]
    pub max_clients: usize,

    /// Forget clients idle this long; 0 disables the sweep
    #[arg(long, env = "CLIENT_IDLE_TTL", default_value = "10m", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub client_idle_ttl: Duration,

    /// How often idle clients are swept
    #[arg(long, env = "SWEEP_INTERVAL", default_value = "5m", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Longest wait for in-flight requests on shutdown
    #[arg(long, env = "DRAIN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log_level: "info".to_string(),
            global_burst: 5,
            global_refill_interval: Duration::from_secs(1),
            client_burst: 5,
            client_refill_interval: Duration::from_secs(1),
            key_strategy: KeyStrategy::RemoteIp,
            max_clients: 100_000,
            client_idle_ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and command-line flags, then validate it.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let config = Config::parse();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    pub fn global_bucket(&self) -> BucketSettings {
        BucketSettings::new(self.global_refill_interval, self.global_burst)
    }

    pub fn client_bucket(&self) -> BucketSettings {
        BucketSettings::new(self.client_refill_interval, self.client_burst)
    }

    /// Idle TTL, or `None` when the sweep is disabled.
    pub fn idle_sweep(&self) -> Option<Duration> {
        (!self.client_idle_ttl.is_zero()).then_some(self.client_idle_ttl)
    }
}
