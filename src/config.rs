//! Configuration for meridian-node.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upstream API family served by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiInterface {
    /// Ethereum-style JSON-RPC.
    #[default]
    Jsonrpc,
    /// Tendermint RPC (JSON-RPC over HTTP/WS with path routing).
    Tendermintrpc,
    /// REST endpoints.
    Rest,
    /// gRPC endpoints.
    Grpc,
}

impl ApiInterface {
    /// Stable name used in cache keys and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jsonrpc => "jsonrpc",
            Self::Tendermintrpc => "tendermintrpc",
            Self::Rest => "rest",
            Self::Grpc => "grpc",
        }
    }
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Chain this node serves or consumes (e.g. "ETH1").
    pub chain_id: String,

    /// API family of the served endpoint.
    #[serde(default)]
    pub api_interface: ApiInterface,

    /// Listen address for the provider's relay server.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// URL of the upstream node the provider forwards relays to.
    pub node_url: String,

    /// Address of the remote relay cache; empty disables caching.
    #[serde(default)]
    pub cache_addr: String,

    /// Chain tracker configuration.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Session limits.
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Relay timeout budget.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Chain tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// How many recent block hashes to keep in the window.
    #[serde(default = "default_blocks_to_save")]
    pub blocks_to_save: u64,

    /// Average block time of the tracked chain, in milliseconds. The poll
    /// interval is this divided by [`TrackerConfig::polls_per_block`].
    #[serde(default = "default_average_block_time_ms")]
    pub average_block_time_ms: u64,

    /// Poll frequency multiplier; polling faster than the block time keeps
    /// jitter from skipping a block.
    #[serde(default = "default_polls_per_block")]
    pub polls_per_block: u64,

    /// How many fetch retries before a poll iteration gives up.
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
}

impl TrackerConfig {
    /// The interval between polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.average_block_time_ms / self.polls_per_block.max(1))
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            blocks_to_save: default_blocks_to_save(),
            average_block_time_ms: default_average_block_time_ms(),
            polls_per_block: default_polls_per_block(),
            fetch_retries: default_fetch_retries(),
        }
    }
}

/// Session limits, shared by the consumer and provider runtimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrently open sessions per provider pairing.
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_provider: usize,

    /// How many blocklisted sessions a provider may accumulate before the
    /// provider itself is blocked for the epoch.
    #[serde(default = "default_max_blocklisted_sessions")]
    pub max_blocklisted_sessions: usize,

    /// Consecutive failures after which a session is blocklisted.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_provider: default_max_sessions(),
            max_blocklisted_sessions: default_max_blocklisted_sessions(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

/// Relay timeout budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Base deadline for any outbound call, in milliseconds.
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    /// Additional budget per compute unit, in milliseconds.
    #[serde(default = "default_time_per_cu_ms")]
    pub time_per_cu_ms: u64,

    /// One-way latency budget added on top, in milliseconds.
    #[serde(default = "default_world_latency_ms")]
    pub average_world_latency_ms: u64,
}

impl TimeoutConfig {
    /// Deadline for a relay costing `cu` compute units.
    #[must_use]
    pub fn relay_timeout(&self, cu: u64) -> Duration {
        Duration::from_millis(
            self.base_timeout_ms + cu * self.time_per_cu_ms + self.average_world_latency_ms,
        )
    }

    /// The upstream-node share of the budget for `cu` compute units.
    #[must_use]
    pub fn local_node_time(&self, cu: u64) -> Duration {
        Duration::from_millis(cu * self.time_per_cu_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout_ms(),
            time_per_cu_ms: default_time_per_cu_ms(),
            average_world_latency_ms: default_world_latency_ms(),
        }
    }
}

impl NodeConfig {
    /// Create a development configuration preset pointing at a local node.
    #[must_use]
    pub fn development(chain_id: &str) -> Self {
        Self {
            chain_id: chain_id.to_string(),
            api_interface: ApiInterface::default(),
            listen_addr: default_listen_addr(),
            node_url: "http://127.0.0.1:8545".to_string(),
            cache_addr: String::new(),
            tracker: TrackerConfig::default(),
            sessions: SessionConfig::default(),
            timeouts: TimeoutConfig::default(),
            log_level: "debug".to_string(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:2224".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_blocks_to_save() -> u64 {
    20
}

const fn default_average_block_time_ms() -> u64 {
    12_000
}

const fn default_polls_per_block() -> u64 {
    4
}

const fn default_fetch_retries() -> u32 {
    3
}

const fn default_max_sessions() -> usize {
    10
}

const fn default_max_blocklisted_sessions() -> usize {
    3
}

const fn default_max_consecutive_failures() -> u64 {
    3
}

const fn default_base_timeout_ms() -> u64 {
    5_000
}

const fn default_time_per_cu_ms() -> u64 {
    100
}

const fn default_world_latency_ms() -> u64 {
    200
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_divides_block_time() {
        let tracker = TrackerConfig::default();
        assert_eq!(tracker.poll_interval(), Duration::from_millis(3_000));
    }

    #[test]
    fn test_relay_timeout_budget() {
        let timeouts = TimeoutConfig::default();
        // base 5s + 10 CU * 100ms + 200ms world latency
        assert_eq!(timeouts.relay_timeout(10), Duration::from_millis(6_200));
        assert_eq!(timeouts.local_node_time(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let config = NodeConfig::development("ETH1");
        config.to_file(&path).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.chain_id, "ETH1");
        assert_eq!(loaded.api_interface, ApiInterface::Jsonrpc);
        assert_eq!(
            loaded.sessions.max_sessions_per_provider,
            config.sessions.max_sessions_per_provider
        );
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            chain_id = "OSMO"
            node_url = "http://localhost:26657"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tracker.blocks_to_save, 20);
        assert_eq!(parsed.listen_addr, "0.0.0.0:2224");
        assert!(parsed.cache_addr.is_empty());
    }
}
