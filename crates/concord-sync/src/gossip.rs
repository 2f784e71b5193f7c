//! Concord Gossip Engine
//!
//! Epidemic state dissemination with SWIM-style failure detection. The engine
//! is a pure state machine: callers pass in the current instant and carry the
//! messages it produces, which keeps every transition reproducible in tests.
//!
//! Key Features:
//! - Peer directory with alive, suspect and dead states
//! - Push, pull and push-pull exchanges of the full key/value state
//! - Vector clock advanced on every local write and every received message
//! - Pluggable per-key merge policy
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::merge::{CrdtMerge, LastWriteWins, StateMerge};
use crate::node::{PeerRecord, PeerStatus};
use crate::vector_clock::VectorClock;
use concord_common::config::GossipConfig;
use concord_common::utils::now_millis;
use concord_common::{NodeId, Result, SyncError};
use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// Dead peers are pinged on every this-many heartbeats.
const DEAD_PING_PERIOD: u64 = 4;

// =============================================================================
// Gossip Message
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipMessageType {
    SyncRequest,
    SyncResponse,
    Push,
    Pull,
    PushPull,
    Ping,
    Pong,
}

impl GossipMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GossipMessageType::SyncRequest => "sync_request",
            GossipMessageType::SyncResponse => "sync_response",
            GossipMessageType::Push => "push",
            GossipMessageType::Pull => "pull",
            GossipMessageType::PushPull => "push_pull",
            GossipMessageType::Ping => "ping",
            GossipMessageType::Pong => "pong",
        }
    }

    /// Whether messages of this type carry the sender's full state.
    pub fn carries_state(&self) -> bool {
        matches!(
            self,
            GossipMessageType::SyncResponse | GossipMessageType::Push | GossipMessageType::PushPull
        )
    }

    fn parse(tag: &str) -> Option<Self> {
        let kind = match tag {
            "sync_request" => GossipMessageType::SyncRequest,
            "sync_response" => GossipMessageType::SyncResponse,
            "push" => GossipMessageType::Push,
            "pull" => GossipMessageType::Pull,
            "push_pull" => GossipMessageType::PushPull,
            "ping" => GossipMessageType::Ping,
            "pong" => GossipMessageType::Pong,
            _ => return None,
        };
        Some(kind)
    }
}

/// A gossip exchange between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: GossipMessageType,
    pub sender_id: NodeId,
    pub recipient_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BTreeMap<String, Value>>,
    pub vector_clock: VectorClock,
    pub timestamp: u64,
}

impl GossipMessage {
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a wire message, rejecting unknown types before field decoding.
    pub fn from_json(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Decode("gossip message without a type".to_string()))?;
        if GossipMessageType::parse(tag).is_none() {
            return Err(SyncError::UnknownMessageType(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Gossip Statistics
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub rounds_completed: u64,
    pub keys_merged: u64,
    pub failed_exchanges: u64,
    pub alive_peers: usize,
    pub suspect_peers: usize,
    pub dead_peers: usize,
    pub state_size: usize,
}

// =============================================================================
// Gossip Engine
// =============================================================================

pub struct GossipEngine<S: StateMerge = LastWriteWins> {
    node_id: NodeId,
    address: String,
    config: GossipConfig,
    peers: BTreeMap<NodeId, PeerRecord>,
    state: BTreeMap<String, Value>,
    clock: VectorClock,
    merger: S,
    stats: GossipStats,
    heartbeats: u64,
}

impl GossipEngine<LastWriteWins> {
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>, config: GossipConfig) -> Self {
        Self::with_merger(node_id, address, config, LastWriteWins)
    }
}

impl<S: StateMerge> GossipEngine<S> {
    pub fn with_merger(
        node_id: impl Into<NodeId>,
        address: impl Into<String>,
        config: GossipConfig,
        merger: S,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            clock: VectorClock::new(node_id.clone()),
            node_id,
            address: address.into(),
            config,
            peers: BTreeMap::new(),
            state: BTreeMap::new(),
            merger,
            stats: GossipStats::default(),
            heartbeats: 0,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn merger(&self) -> &S {
        &self.merger
    }

    pub fn merger_mut(&mut self) -> &mut S {
        &mut self.merger
    }

    // =========================================================================
    // Peer Directory
    // =========================================================================

    /// Add or refresh a peer. Returns false for our own id.
    pub fn add_peer(
        &mut self,
        id: impl Into<NodeId>,
        address: impl Into<String>,
        metadata: BTreeMap<String, String>,
        now: Instant,
    ) -> bool {
        let id = id.into();
        if id == self.node_id {
            return false;
        }

        let address = address.into();
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.address = address;
                peer.metadata = metadata;
            }
            None => {
                tracing::debug!(node = %self.node_id, peer = %id, "gossip peer added");
                let record = PeerRecord::new(id.clone(), address, now).with_metadata(metadata);
                self.peers.insert(id, record);
            }
        }
        true
    }

    pub fn remove_peer(&mut self, id: &NodeId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Peers, optionally restricted to one status.
    pub fn peers(&self, status: Option<PeerStatus>) -> Vec<&PeerRecord> {
        self.peers
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .collect()
    }

    pub fn alive_peers(&self) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.is_alive())
            .map(|p| p.id.clone())
            .collect()
    }

    // =========================================================================
    // Local State
    // =========================================================================

    /// Write a key locally. Every local write is a new event on our clock.
    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.clock.increment();
        self.state.insert(key.into(), value);
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn all_state(&self) -> &BTreeMap<String, Value> {
        &self.state
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    pub fn make_message(&mut self, to: &NodeId, message_type: GossipMessageType) -> GossipMessage {
        self.stats.messages_sent += 1;
        GossipMessage {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender_id: self.node_id.clone(),
            recipient_id: to.clone(),
            state: message_type.carries_state().then(|| self.state.clone()),
            vector_clock: self.clock.clone(),
            timestamp: now_millis(),
        }
    }

    /// Pick up to `fanout` distinct alive peers at random.
    pub fn select_gossip_targets<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<NodeId> {
        self.peers
            .values()
            .filter(|p| p.is_alive())
            .map(|p| p.id.clone())
            .choose_multiple(rng, self.config.fanout)
    }

    /// Peers to ping on this heartbeat: every alive and suspect peer, and the
    /// dead ones every `DEAD_PING_PERIOD` heartbeats. A single reply from a
    /// dead peer brings it back.
    pub fn heartbeat_targets(&mut self) -> Vec<NodeId> {
        self.heartbeats += 1;
        let ping_dead = self.heartbeats % DEAD_PING_PERIOD == 0;
        self.peers
            .values()
            .filter(|p| p.status != PeerStatus::Dead || ping_dead)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Process an inbound message and produce the reply, if any.
    ///
    /// Any message counts as contact from its sender.
    pub fn handle_message(&mut self, message: GossipMessage, now: Instant) -> Result<Option<GossipMessage>> {
        self.stats.messages_received += 1;
        self.clock.update(&message.vector_clock);

        let sender = message.sender_id.clone();
        if let Some(peer) = self.peers.get_mut(&sender) {
            let previous = peer.mark_seen(now);
            if previous != PeerStatus::Alive {
                tracing::info!(node = %self.node_id, peer = %sender, from = %previous, "peer is alive again");
            }
        }

        let reply = match message.message_type {
            GossipMessageType::SyncRequest => Some(self.make_message(&sender, GossipMessageType::SyncResponse)),
            GossipMessageType::SyncResponse | GossipMessageType::Push => {
                if let Some(state) = message.state {
                    self.merge_state(state)?;
                }
                None
            }
            GossipMessageType::Pull => Some(self.make_message(&sender, GossipMessageType::Push)),
            GossipMessageType::PushPull => {
                // The sender still gets our state when some of theirs is rejected.
                if let Some(state) = message.state {
                    let _ = self.merge_state(state);
                }
                Some(self.make_message(&sender, GossipMessageType::Push))
            }
            GossipMessageType::Ping => Some(self.make_message(&sender, GossipMessageType::Pong)),
            GossipMessageType::Pong => None,
        };
        Ok(reply)
    }

    /// Fold a remote state map into ours. Returns the number of keys that
    /// changed.
    ///
    /// A key that fails to merge is skipped and the rest still apply; the
    /// first such error is returned once every key has been tried.
    pub fn merge_state(&mut self, remote: BTreeMap<String, Value>) -> Result<usize> {
        let mut changed = 0;
        let mut first_error = None;
        for (key, value) in remote {
            let local = self.state.get(&key);
            match self.merger.merge_value(&key, local, &value) {
                Ok(Some(merged)) => {
                    self.state.insert(key, merged);
                    changed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(node = %self.node_id, key = %key, error = %e, "skipping unmergeable key");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats.keys_merged += changed as u64;
        match first_error {
            Some(e) => Err(e),
            None => Ok(changed),
        }
    }

    // =========================================================================
    // Failure Detection
    // =========================================================================

    /// Count a failed or timed-out exchange with `peer`. Returns true when it
    /// pushed the peer to suspect.
    pub fn record_failure(&mut self, peer: &NodeId) -> bool {
        self.stats.failed_exchanges += 1;
        let Some(record) = self.peers.get_mut(peer) else {
            return false;
        };
        let suspected = record.record_failure(self.config.max_failures);
        if suspected {
            tracing::warn!(
                node = %self.node_id,
                peer = %peer,
                failures = record.consecutive_failures,
                "peer suspected after repeated failures"
            );
        }
        suspected
    }

    /// Advance peers through alive, suspect and dead by how long they have
    /// been silent. Returns every transition made.
    pub fn detect_failures(&mut self, now: Instant) -> Vec<(NodeId, PeerStatus)> {
        let suspect_after = self.config.suspect_timeout;
        let dead_after = self.config.suspect_timeout + self.config.dead_timeout;
        let mut transitions = Vec::new();

        for peer in self.peers.values_mut() {
            let silence = peer.silence(now);
            if peer.status == PeerStatus::Alive && silence > suspect_after {
                peer.mark_suspect();
                tracing::warn!(node = %self.node_id, peer = %peer.id, silence_ms = silence.as_millis() as u64, "peer suspected");
                transitions.push((peer.id.clone(), PeerStatus::Suspect));
            }
            if peer.status == PeerStatus::Suspect && silence > dead_after {
                peer.mark_dead();
                tracing::warn!(node = %self.node_id, peer = %peer.id, silence_ms = silence.as_millis() as u64, "peer declared dead");
                transitions.push((peer.id.clone(), PeerStatus::Dead));
            }
        }
        transitions
    }

    // =========================================================================
    // Rounds and Diagnostics
    // =========================================================================

    pub fn complete_round(&mut self) {
        self.stats.rounds_completed += 1;
    }

    pub fn rounds_completed(&self) -> u64 {
        self.stats.rounds_completed
    }

    /// Diagnostic only: there is someone to talk to and we have talked.
    pub fn has_converged(&self) -> bool {
        self.stats.rounds_completed > 0 && self.peers.values().any(PeerRecord::is_alive)
    }

    pub fn stats(&self) -> GossipStats {
        let count = |status: PeerStatus| self.peers.values().filter(|p| p.status == status).count();
        GossipStats {
            alive_peers: count(PeerStatus::Alive),
            suspect_peers: count(PeerStatus::Suspect),
            dead_peers: count(PeerStatus::Dead),
            state_size: self.state.len(),
            ..self.stats
        }
    }
}

impl GossipEngine<CrdtMerge> {
    /// Copy CRDT `id`'s serialized state into the gossiped key space.
    pub fn publish_crdt(&mut self, id: &str) -> Result<()> {
        let state = self
            .merger
            .registry()
            .get_shared_state(id)?
            .ok_or_else(|| SyncError::CrdtNotFound(id.to_string()))?;
        let key = self.merger.state_key(id);
        self.set_state(key, state);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
