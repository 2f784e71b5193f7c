//! Concord Node
//!
//! Raft roles and the gossip peer records with their liveness transitions.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use concord_common::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

// =============================================================================
// Node Role
// =============================================================================

/// Role of a node in the Raft cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Follower node that replicates from leader.
    #[default]
    Follower,
    /// Candidate node during leader election.
    Candidate,
    /// Leader node that handles writes.
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Follower => "follower",
            NodeRole::Candidate => "candidate",
            NodeRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Peer Status
// =============================================================================

/// Liveness of a gossip peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Alive,
    Suspect,
    Dead,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerStatus::Alive => "alive",
            PeerStatus::Suspect => "suspect",
            PeerStatus::Dead => "dead",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Peer Record
// =============================================================================

/// Membership record for one gossip peer.
///
/// Status only moves forward (alive, suspect, dead) except that any contact
/// resets the peer to alive with a clean failure count.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: String,
    pub status: PeerStatus,
    pub last_seen: Instant,
    pub consecutive_failures: u32,
    pub metadata: BTreeMap<String, String>,
}

impl PeerRecord {
    pub fn new(id: NodeId, address: impl Into<String>, now: Instant) -> Self {
        Self {
            id,
            address: address.into(),
            status: PeerStatus::Alive,
            last_seen: now,
            consecutive_failures: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record contact from the peer. Returns the previous status.
    pub fn mark_seen(&mut self, now: Instant) -> PeerStatus {
        let previous = self.status;
        self.last_seen = now;
        self.consecutive_failures = 0;
        self.status = PeerStatus::Alive;
        previous
    }

    /// Count a failed exchange. Returns true when this failure made the
    /// peer suspect.
    pub fn record_failure(&mut self, max_failures: u32) -> bool {
        self.consecutive_failures += 1;
        if self.status == PeerStatus::Alive && self.consecutive_failures >= max_failures {
            self.status = PeerStatus::Suspect;
            return true;
        }
        false
    }

    pub fn mark_suspect(&mut self) {
        if self.status == PeerStatus::Alive {
            self.status = PeerStatus::Suspect;
        }
    }

    pub fn mark_dead(&mut self) {
        self.status = PeerStatus::Dead;
    }

    pub fn is_alive(&self) -> bool {
        self.status == PeerStatus::Alive
    }

    /// Time since the last contact.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(NodeRole::default(), NodeRole::Follower);
        assert_eq!(NodeRole::Leader.to_string(), "leader");
        assert_eq!(serde_json::to_string(&NodeRole::Candidate).unwrap(), "\"candidate\"");
    }

    #[test]
    fn test_failures_make_peer_suspect() {
        let now = Instant::now();
        let mut peer = PeerRecord::new(NodeId::new("p1"), "10.0.0.2:7000", now);

        assert!(!peer.record_failure(3));
        assert!(!peer.record_failure(3));
        assert!(peer.record_failure(3));
        assert_eq!(peer.status, PeerStatus::Suspect);
        assert!(!peer.record_failure(3));
    }

    #[test]
    fn test_contact_resets_any_status() {
        let start = Instant::now();
        let mut peer = PeerRecord::new(NodeId::new("p1"), "addr", start);
        peer.record_failure(1);
        peer.mark_dead();

        let later = start + Duration::from_secs(5);
        assert_eq!(peer.mark_seen(later), PeerStatus::Dead);
        assert!(peer.is_alive());
        assert_eq!(peer.consecutive_failures, 0);
        assert_eq!(peer.silence(later), Duration::ZERO);
        assert_eq!(peer.silence(later + Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_mark_suspect_only_from_alive() {
        let mut peer = PeerRecord::new(NodeId::new("p1"), "addr", Instant::now());
        peer.mark_dead();
        peer.mark_suspect();
        assert_eq!(peer.status, PeerStatus::Dead);
    }
}
