//! Configuration types for price-relay

use serde::Deserialize;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    pub telemetry: TelemetryConfig,
}

/// Upstream feed endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Primary feed WebSocket endpoint
    pub primary_url: String,
    /// Secondary feed WebSocket endpoint, used on failover
    pub secondary_url: String,
    /// Symbols to subscribe on both feeds (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,
}

/// Cache staleness configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are flagged stale (still served)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Failover and reconnect tuning
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Seconds of feed silence before failover triggers
    #[serde(default = "default_silence_secs")]
    pub silence_window_secs: u64,

    /// Base reconnect delay (milliseconds), doubled per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Hard cap on the reconnect delay (milliseconds)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_silence_secs() -> u64 {
    10
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            silence_window_secs: default_silence_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn silence_window(&self) -> Duration {
        Duration::from_secs(self.silence_window_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Downstream broadcast tuning
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Listen address for the subscription WebSocket server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Broadcast tick interval (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,

    /// Keep-alive ping interval (seconds); longer than the tick
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,

    /// Grace period after keep-alive before a silent client is pruned (seconds)
    #[serde(default = "default_keepalive_grace_secs")]
    pub keepalive_grace_secs: u64,

    /// Per-connection write timeout (milliseconds)
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Consecutive slow writes before a client is force-closed
    #[serde(default = "default_max_slow_writes")]
    pub max_slow_writes: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_keepalive_secs() -> u64 {
    20
}
fn default_keepalive_grace_secs() -> u64 {
    10
}
fn default_write_timeout_ms() -> u64 {
    200
}
fn default_max_slow_writes() -> u32 {
    3
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tick_interval_ms: default_tick_ms(),
            keepalive_interval_secs: default_keepalive_secs(),
            keepalive_grace_secs: default_keepalive_grace_secs(),
            write_timeout_ms: default_write_timeout_ms(),
            max_slow_writes: default_max_slow_writes(),
        }
    }
}

impl BroadcastConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_grace(&self) -> Duration {
        Duration::from_secs(self.keepalive_grace_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub metrics_port: u16,
    pub log_level: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn full_toml() -> &'static str {
        r#"
            [feed]
            primary_url = "wss://stream.binance.com:9443/ws"
            secondary_url = "wss://ws-feed.exchange.coinbase.com"
            symbols = ["BTCUSDT", "ETHUSDT"]

            [cache]
            ttl_secs = 45

            [aggregator]
            silence_window_secs = 8
            backoff_base_ms = 250
            backoff_cap_ms = 15000

            [broadcast]
            bind_addr = "127.0.0.1:9001"
            tick_interval_ms = 500
            keepalive_interval_secs = 15
            keepalive_grace_secs = 5
            write_timeout_ms = 100
            max_slow_writes = 2

            [telemetry]
            metrics_port = 9090
            log_level = "info"
        "#
    }

    #[test]
    fn test_config_deserialize() {
        let config: Config = toml::from_str(full_toml()).unwrap();
        assert_eq!(config.feed.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(config.cache.ttl_secs, 45);
        assert_eq!(config.aggregator.silence_window_secs, 8);
        assert_eq!(config.broadcast.max_slow_writes, 2);
        assert_eq!(config.telemetry.metrics_port, 9090);
    }

    #[test]
    fn test_config_defaults() {
        let toml = r#"
            [feed]
            primary_url = "wss://primary.example"
            secondary_url = "wss://secondary.example"
            symbols = ["BTCUSDT"]

            [telemetry]
            metrics_port = 9090
            log_level = "debug"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.aggregator.backoff_base_ms, 500);
        assert_eq!(config.aggregator.backoff_cap_ms, 30_000);
        assert_eq!(config.broadcast.tick_interval_ms, 1000);
        assert_eq!(config.broadcast.max_slow_writes, 3);
    }

    #[test]
    fn test_duration_accessors() {
        let config: Config = toml::from_str(full_toml()).unwrap();
        assert_eq!(config.cache.ttl(), Duration::from_secs(45));
        assert_eq!(config.aggregator.silence_window(), Duration::from_secs(8));
        assert_eq!(config.aggregator.backoff_base(), Duration::from_millis(250));
        assert_eq!(config.broadcast.write_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(full_toml().as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.broadcast.bind_addr, "127.0.0.1:9001");
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(result.is_err());
    }
}
