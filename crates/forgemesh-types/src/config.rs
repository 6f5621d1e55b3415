//! Node configuration.
//!
//! Every field carries a serde default so a partial `config.toml` (or none
//! at all) yields a usable node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 23001;

/// Default heartbeat broadcast interval (ms).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default outbound connection timeout (ms).
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;

/// Default time without a heartbeat before a peer is considered stale (ms).
pub const DEFAULT_STALE_TIMEOUT_MS: u64 = 60_000;

/// Default outbox retry interval used by long-running callers (ms).
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 30_000;

/// Minimum ratio between stale timeout and heartbeat interval.
const STALE_TO_HEARTBEAT_RATIO: u64 = 2;

/// An address to dial at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub host: String,
    pub port: u16,
}

impl BootstrapPeer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for BootstrapPeer {
    type Err = String;

    /// Parse `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{s}'"))?;
        if host.is_empty() {
            return Err(format!("missing host in '{s}'"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{s}': {e}"))?;
        Ok(Self::new(host, port))
    }
}

/// Configuration consumed when constructing a mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier. Random when not configured.
    pub node_id: String,
    /// Host to bind the listener to.
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port).
    pub port: u16,
    /// Peers dialed once at startup.
    pub bootstrap_peers: Vec<BootstrapPeer>,
    /// How often heartbeats are broadcast and stale peers pruned.
    pub heartbeat_interval_ms: u64,
    /// Bound on establishing an outbound connection.
    pub connection_timeout_ms: u64,
    /// A connected peer silent for longer than this is marked disconnected.
    pub stale_timeout_ms: u64,
    /// How often a long-running process retries queued agent messages.
    pub retry_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            bootstrap_peers: Vec::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            stale_timeout_ms: DEFAULT_STALE_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl NodeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Check the configuration for values that will misbehave at runtime.
    ///
    /// Returns one human-readable warning per problem; an empty list means
    /// the configuration is sound. Nothing here is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.node_id.trim().is_empty() {
            warnings.push("node_id is empty".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            warnings.push("heartbeat_interval_ms is 0; heartbeats are disabled".to_string());
        }
        if self.connection_timeout_ms == 0 {
            warnings.push("connection_timeout_ms is 0; every dial will time out".to_string());
        }
        if self.heartbeat_interval_ms > 0
            && self.stale_timeout_ms < self.heartbeat_interval_ms * STALE_TO_HEARTBEAT_RATIO
        {
            warnings.push(format!(
                "stale_timeout_ms ({}) is less than {}x heartbeat_interval_ms ({}); \
                 a single missed heartbeat will disconnect a peer",
                self.stale_timeout_ms, STALE_TO_HEARTBEAT_RATIO, self.heartbeat_interval_ms
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 23001);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.stale_timeout(), Duration::from_secs(60));
        assert!(config.bootstrap_peers.is_empty());
        assert!(!config.node_id.is_empty());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_random_node_ids_differ() {
        assert_ne!(NodeConfig::default().node_id, NodeConfig::default().node_id);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NodeConfig = toml::from_str(
            r#"
            node_id = "alpha"
            port = 4000

            [[bootstrap_peers]]
            host = "10.0.0.2"
            port = 23001
            "#,
        )
        .unwrap();
        assert_eq!(config.node_id, "alpha");
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.stale_timeout_ms, DEFAULT_STALE_TIMEOUT_MS);
        assert_eq!(config.bootstrap_peers, vec![BootstrapPeer::new("10.0.0.2", 23001)]);
    }

    #[test]
    fn test_validate_flags_short_stale_timeout() {
        let config = NodeConfig {
            heartbeat_interval_ms: 30_000,
            stale_timeout_ms: 45_000,
            ..NodeConfig::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("stale_timeout_ms"));
    }

    #[test]
    fn test_bootstrap_peer_parse() {
        let peer: BootstrapPeer = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(peer, BootstrapPeer::new("127.0.0.1", 9000));
        assert_eq!(peer.to_string(), "127.0.0.1:9000");
        assert!("no-port".parse::<BootstrapPeer>().is_err());
        assert!(":9000".parse::<BootstrapPeer>().is_err());
        assert!("host:notaport".parse::<BootstrapPeer>().is_err());
    }
}
