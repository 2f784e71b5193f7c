//! Concord Config - Configuration Structures
//!
//! Configuration for the consensus, gossip, CRDT and logging layers. Every
//! structure has working defaults, `with_*` builders for programmatic setup,
//! and a TOML representation in which durations are written in milliseconds.
//!
//! Key Features:
//! - Raft timing, snapshot and batching parameters
//! - Gossip intervals, fanout and failure-detection thresholds
//! - CRDT persistence namespace
//! - Node-level configuration loaded from TOML with validation
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::error::SyncError;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serde adapter storing a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Raft Configuration
// =============================================================================

/// Configuration for a Raft node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Election timeout base `T`; each election waits uniformly in `[T, 2T]`.
    #[serde(rename = "election_timeout_ms", with = "duration_ms")]
    pub election_timeout: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "rpc_timeout_ms", with = "duration_ms")]
    pub rpc_timeout: Duration,
    /// Log length above which the applied prefix is compacted into a snapshot.
    pub snapshot_threshold: usize,
    pub max_entries_per_request: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(1000),
            snapshot_threshold: 1000,
            max_entries_per_request: 100,
        }
    }
}

impl RaftConfig {
    pub fn with_election_timeout(mut self, base: Duration) -> Self {
        self.election_timeout = base;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: usize) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_max_entries_per_request(mut self, max: usize) -> Self {
        self.max_entries_per_request = max;
        self
    }

    /// Check the timing relationships the protocol depends on.
    pub fn validate(&self) -> crate::Result<()> {
        if self.election_timeout.is_zero() {
            return Err(SyncError::Configuration(
                "raft election timeout must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout {
            return Err(SyncError::Configuration(format!(
                "raft heartbeat interval ({:?}) must be positive and below the election timeout ({:?})",
                self.heartbeat_interval, self.election_timeout
            )));
        }
        if self.snapshot_threshold == 0 || self.max_entries_per_request == 0 {
            return Err(SyncError::Configuration(
                "raft snapshot threshold and batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Gossip Configuration
// =============================================================================

/// Configuration for a gossip engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    #[serde(rename = "gossip_interval_ms", with = "duration_ms")]
    pub gossip_interval: Duration,
    pub fanout: usize,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "suspect_timeout_ms", with = "duration_ms")]
    pub suspect_timeout: Duration,
    /// Additional silence, after `suspect_timeout`, before a peer is dead.
    #[serde(rename = "dead_timeout_ms", with = "duration_ms")]
    pub dead_timeout: Duration,
    pub max_failures: u32,
    #[serde(rename = "rpc_timeout_ms", with = "duration_ms")]
    pub rpc_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(1000),
            fanout: 3,
            heartbeat_interval: Duration::from_millis(5000),
            suspect_timeout: Duration::from_millis(10_000),
            dead_timeout: Duration::from_millis(30_000),
            max_failures: 3,
            rpc_timeout: Duration::from_millis(1000),
        }
    }
}

impl GossipConfig {
    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_suspect_timeout(mut self, timeout: Duration) -> Self {
        self.suspect_timeout = timeout;
        self
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.fanout == 0 {
            return Err(SyncError::Configuration(
                "gossip fanout must be at least 1".to_string(),
            ));
        }
        if self.gossip_interval.is_zero()
            || self.heartbeat_interval.is_zero()
            || self.suspect_timeout.is_zero()
        {
            return Err(SyncError::Configuration(
                "gossip intervals must be positive".to_string(),
            ));
        }
        if self.max_failures == 0 {
            return Err(SyncError::Configuration(
                "gossip max_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CRDT Configuration
// =============================================================================

/// Configuration for a CRDT registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtConfig {
    /// Prefix of persisted keys (`<namespace>:<id>`).
    pub namespace: String,
    /// Prefix of gossiped state keys that carry CRDT payloads.
    pub gossip_prefix: String,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            namespace: "crdt".to_string(),
            gossip_prefix: "crdt:".to_string(),
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Configuration for a peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub address: String,
}

/// Top-level configuration for one Concord node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub address: String,
    pub peers: Vec<PeerConfig>,
    pub raft: RaftConfig,
    pub gossip: GossipConfig,
    pub crdt: CrdtConfig,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("node-1"),
            address: "127.0.0.1:7400".to_string(),
            peers: Vec::new(),
            raft: RaftConfig::default(),
            gossip: GossipConfig::default(),
            crdt: CrdtConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SyncError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.as_str().is_empty() {
            return Err(SyncError::Configuration("node_id must not be empty".to_string()));
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(SyncError::Configuration(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        self.raft.validate()?;
        self.gossip.validate()
    }

    /// Peer identifiers in configuration order.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id.clone()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.raft.election_timeout, Duration::from_millis(150));
        assert_eq!(config.gossip.fanout, 3);
        assert_eq!(config.crdt.namespace, "crdt");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            node_id = "n1"

            [[peers]]
            node_id = "n2"
            address = "127.0.0.1:7401"

            [raft]
            election_timeout_ms = 300
            heartbeat_interval_ms = 30

            [gossip]
            fanout = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, NodeId::new("n1"));
        assert_eq!(config.peer_ids(), vec![NodeId::new("n2")]);
        assert_eq!(config.raft.election_timeout, Duration::from_millis(300));
        assert_eq!(config.raft.heartbeat_interval, Duration::from_millis(30));
        assert_eq!(config.raft.snapshot_threshold, 1000);
        assert_eq!(config.gossip.fanout, 2);
        assert_eq!(config.gossip.dead_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_invalid_timing_is_rejected() {
        let err = NodeConfig::from_toml(
            r#"
            [raft]
            election_timeout_ms = 100
            heartbeat_interval_ms = 200
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        let err = NodeConfig::from_toml("[gossip]\nfanout = 0\n").unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_self_peer_is_rejected() {
        let mut config = NodeConfig::default();
        config.peers.push(PeerConfig {
            node_id: config.node_id.clone(),
            address: "127.0.0.1:1".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_id = \"file-node\"\naddress = \"10.0.0.1:7400\"").unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id.as_str(), "file-node");
        assert_eq!(config.address, "10.0.0.1:7400");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = NodeConfig::from_file("/nonexistent/concord.toml").unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }

    #[test]
    fn test_builders() {
        let raft = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(500))
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_snapshot_threshold(10);
        raft.validate().unwrap();
        assert_eq!(raft.snapshot_threshold, 10);

        let gossip = GossipConfig::default().with_fanout(5).with_max_failures(2);
        gossip.validate().unwrap();
        assert_eq!(gossip.fanout, 5);
    }
}
