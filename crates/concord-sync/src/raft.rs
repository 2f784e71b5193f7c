//! Concord Raft Consensus
//!
//! Deterministic Raft core: leader election, log replication, commitment and
//! snapshot installation. The node never touches clocks or sockets; the
//! service layer drives it with timer expiries and inbound RPCs, and sends
//! whatever messages it produces.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::log::{LogEntry, LogIndex, ReplicatedLog, Term};
use crate::node::NodeRole;
use crate::state::{KeyValueStateMachine, Snapshot, SnapshotMetadata, StateMachine};
use concord_common::config::RaftConfig;
use concord_common::utils::quorum_size;
use concord_common::{NodeId, Result, SyncError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

// =============================================================================
// Vote Request/Response
// =============================================================================

/// Request for a vote during leader election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub voter_id: NodeId,
}

// =============================================================================
// Append Entries Request/Response
// =============================================================================

/// Request to append entries to the log. Empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// Response to an append entries request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
    pub follower_id: NodeId,
}

// =============================================================================
// Install Snapshot Request/Response
// =============================================================================

/// Request to install a snapshot. The whole state travels as one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub state: Value,
}

/// Response to an install snapshot request. `last_included_index` is 0 when
/// the request was rejected for a stale term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub last_included_index: LogIndex,
    pub follower_id: NodeId,
}

// =============================================================================
// Raft Message
// =============================================================================

/// Every Raft RPC on the wire, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    RequestVote(VoteRequest),
    RequestVoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

const MESSAGE_TYPES: [&str; 6] = [
    "request_vote",
    "request_vote_response",
    "append_entries",
    "append_entries_response",
    "install_snapshot",
    "install_snapshot_response",
];

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
            RaftMessage::InstallSnapshot(m) => m.term,
            RaftMessage::InstallSnapshotResponse(m) => m.term,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => MESSAGE_TYPES[0],
            RaftMessage::RequestVoteResponse(_) => MESSAGE_TYPES[1],
            RaftMessage::AppendEntries(_) => MESSAGE_TYPES[2],
            RaftMessage::AppendEntriesResponse(_) => MESSAGE_TYPES[3],
            RaftMessage::InstallSnapshot(_) => MESSAGE_TYPES[4],
            RaftMessage::InstallSnapshotResponse(_) => MESSAGE_TYPES[5],
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a wire message. An unrecognized `type` is rejected before any
    /// field decoding.
    pub fn from_json(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Decode("raft message without a type".to_string()))?;
        if !MESSAGE_TYPES.contains(&tag) {
            return Err(SyncError::UnknownMessageType(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

// =============================================================================
// Status and Persistence
// =============================================================================

/// Point-in-time view of a node for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_length: usize,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
}

/// Counters accumulated over the node's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStats {
    pub elections: u64,
    pub term_changes: u64,
    pub log_entries: u64,
    pub snapshots: u64,
    pub entries_applied: u64,
}

/// State that must survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<Snapshot>,
}

// =============================================================================
// Raft Node
// =============================================================================

/// A single Raft participant.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    peers: BTreeSet<NodeId>,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: ReplicatedLog,
    role: NodeRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes_received: HashSet<NodeId>,
    snapshot: Option<Snapshot>,
    state_machine: Box<dyn StateMachine>,
    election_reset: bool,
    stats: RaftStats,
}

impl RaftNode {
    /// Create a follower at term 0 backed by a [`KeyValueStateMachine`].
    pub fn new(
        id: impl Into<NodeId>,
        peers: impl IntoIterator<Item = NodeId>,
        config: RaftConfig,
    ) -> Self {
        let id = id.into();
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Self {
            id,
            config,
            peers,
            current_term: 0,
            voted_for: None,
            log: ReplicatedLog::new(),
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            snapshot: None,
            state_machine: Box::new(KeyValueStateMachine::new()),
            election_reset: false,
            stats: RaftStats::default(),
        }
    }

    /// Replace the apply hook. Must be called before any entry is applied.
    pub fn with_state_machine(mut self, state_machine: Box<dyn StateMachine>) -> Self {
        self.state_machine = state_machine;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// The leader this node currently follows, or itself when leading.
    pub fn leader(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.iter()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum_size(&self) -> usize {
        quorum_size(self.cluster_size())
    }

    pub fn next_index(&self, peer: &NodeId) -> Option<LogIndex> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index(&self, peer: &NodeId) -> Option<LogIndex> {
        self.match_index.get(peer).copied()
    }

    pub fn snapshot_metadata(&self) -> Option<SnapshotMetadata> {
        self.snapshot.as_ref().map(|s| s.metadata)
    }

    /// Serialized state of the apply hook.
    pub fn state_machine_snapshot(&self) -> Result<Value> {
        self.state_machine.snapshot()
    }

    /// Whether something happened since the last call that must restart the
    /// election timer (a granted vote, leader contact, a step-down or a new
    /// candidacy).
    pub fn take_election_reset(&mut self) -> bool {
        std::mem::take(&mut self.election_reset)
    }

    /// A fresh election timeout drawn uniformly from `[T, 2T]`.
    pub fn random_election_timeout<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let base = self.config.election_timeout.as_millis() as u64;
        Duration::from_millis(rng.gen_range(base..=base.saturating_mul(2)))
    }

    fn has_quorum(&self, votes: usize) -> bool {
        votes >= self.quorum_size()
    }

    fn adopt_term(&mut self, term: Term) {
        self.current_term = term;
        self.voted_for = None;
        self.stats.term_changes += 1;
    }

    // =========================================================================
    // Leader Election
    // =========================================================================

    /// Become a candidate for the next term. Returns the vote request to
    /// broadcast, or `None` when there is nobody to ask: a leader ignores the
    /// timeout and a single-node cluster wins outright.
    pub fn start_election(&mut self) -> Option<VoteRequest> {
        if self.is_leader() {
            return None;
        }

        self.adopt_term(self.current_term + 1);
        self.voted_for = Some(self.id.clone());
        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.election_reset = true;
        self.stats.elections += 1;

        tracing::info!(node = %self.id, term = self.current_term, "starting election");

        if self.has_quorum(self.votes_received.len()) {
            self.become_leader();
            return None;
        }

        Some(VoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        if request.term > self.current_term {
            self.become_follower(request.term, None);
        }

        let can_vote = self
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == request.candidate_id);
        let granted = request.term == self.current_term
            && can_vote
            && self
                .log
                .is_up_to_date(request.last_log_index, request.last_log_term);

        if granted {
            self.voted_for = Some(request.candidate_id.clone());
            self.election_reset = true;
        }

        tracing::debug!(
            node = %self.id,
            candidate = %request.candidate_id,
            term = request.term,
            granted,
            "vote request"
        );

        VoteResponse {
            term: self.current_term,
            vote_granted: granted,
            voter_id: self.id.clone(),
        }
    }

    /// Count a vote. Returns true when this response made the node leader.
    pub fn handle_vote_response(&mut self, response: &VoteResponse) -> bool {
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return false;
        }

        if self.role != NodeRole::Candidate
            || response.term != self.current_term
            || !response.vote_granted
            || !self.peers.contains(&response.voter_id)
        {
            return false;
        }

        self.votes_received.insert(response.voter_id.clone());
        if self.has_quorum(self.votes_received.len()) {
            self.become_leader();
            return true;
        }
        false
    }

    /// Step down to follower, adopting `term` when it is newer.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        let previous = self.role;
        if term > self.current_term {
            self.adopt_term(term);
        }

        self.role = NodeRole::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.election_reset = true;

        if previous != NodeRole::Follower {
            tracing::info!(
                node = %self.id,
                term = self.current_term,
                from = %previous,
                "stepping down to follower"
            );
        }
    }

    fn become_leader(&mut self) {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        self.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        self.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();

        tracing::info!(
            node = %self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            "became leader"
        );
    }

    // =========================================================================
    // Log Replication
    // =========================================================================

    /// Append a command to the leader's log and return its index.
    pub fn propose(&mut self, command: impl Into<String>, data: Value) -> Result<LogIndex> {
        if !self.is_leader() {
            return Err(SyncError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let index = self.log.append_command(self.current_term, command, data);
        self.stats.log_entries += 1;

        // Only a single-node cluster can commit here.
        self.advance_commit_index();
        self.apply_committed()?;
        Ok(index)
    }

    /// Whether the entries a peer needs next were compacted into the
    /// snapshot.
    pub fn peer_needs_snapshot(&self, peer: &NodeId) -> bool {
        match self.next_index.get(peer) {
            Some(&next) => self.snapshot.is_some() && next <= self.log.snapshot_index(),
            None => false,
        }
    }

    pub fn create_append_entries(&self, peer: &NodeId) -> Option<AppendEntriesRequest> {
        if !self.is_leader() || self.peer_needs_snapshot(peer) {
            return None;
        }

        let next = *self.next_index.get(peer)?;
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index)?;

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self
                .log
                .entries_from(next, self.config.max_entries_per_request),
            leader_commit: self.commit_index,
        })
    }

    pub fn create_install_snapshot(&self, peer: &NodeId) -> Option<InstallSnapshotRequest> {
        if !self.is_leader() || !self.peers.contains(peer) {
            return None;
        }

        let snapshot = self.snapshot.as_ref()?;
        Some(InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            last_included_index: snapshot.last_included_index(),
            last_included_term: snapshot.last_included_term(),
            state: snapshot.state.clone(),
        })
    }

    /// The next replication RPC for `peer`: entries when its log can be
    /// extended, the snapshot when it has fallen behind compaction.
    pub fn replication_message(&self, peer: &NodeId) -> Option<RaftMessage> {
        if self.peer_needs_snapshot(peer) {
            self.create_install_snapshot(peer)
                .map(RaftMessage::InstallSnapshot)
        } else {
            self.create_append_entries(peer)
                .map(RaftMessage::AppendEntries)
        }
    }

    fn append_response(&self, success: bool, match_index: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            follower_id: self.id.clone(),
        }
    }

    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if request.term < self.current_term {
            return Ok(self.append_response(false, 0));
        }

        self.become_follower(request.term, Some(request.leader_id.clone()));

        // Entries covered by our snapshot are committed and therefore match.
        let snapshot_index = self.log.snapshot_index();
        let (prev_index, prev_term) = if request.prev_log_index < snapshot_index {
            (snapshot_index, self.log.snapshot_term())
        } else {
            (request.prev_log_index, request.prev_log_term)
        };

        if self.log.term_at(prev_index) != Some(prev_term) {
            tracing::debug!(
                node = %self.id,
                prev_log_index = prev_index,
                prev_log_term = prev_term,
                "rejecting append entries: log mismatch"
            );
            return Ok(self.append_response(false, 0));
        }

        let incoming: Vec<LogEntry> = request
            .entries
            .iter()
            .filter(|e| e.index > snapshot_index)
            .cloned()
            .collect();
        if let Some(conflict) = self.log.find_conflict(&incoming) {
            debug_assert!(
                conflict > self.commit_index,
                "committed entry {} conflicts with leader",
                conflict
            );
            tracing::debug!(node = %self.id, index = conflict, "truncating conflicting suffix");
            self.log.truncate_from(conflict);
        }
        for entry in incoming {
            if entry.index > self.log.last_index() {
                self.log.append(entry);
                self.stats.log_entries += 1;
            }
        }

        let last_new = request.prev_log_index + request.entries.len() as u64;
        let commit = request.leader_commit.min(last_new);
        if commit > self.commit_index {
            self.commit_index = commit;
        }
        self.apply_committed()?;

        Ok(self.append_response(true, last_new))
    }

    pub fn handle_append_entries_response(&mut self, response: &AppendEntriesResponse) -> Result<()> {
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return Ok(());
        }
        if !self.is_leader() || response.term != self.current_term {
            return Ok(());
        }
        let Some(next) = self.next_index.get_mut(&response.follower_id) else {
            return Ok(());
        };

        if response.success {
            let matched = self
                .match_index
                .entry(response.follower_id.clone())
                .or_insert(0);
            *matched = (*matched).max(response.match_index);
            *next = *matched + 1;

            if self.advance_commit_index() {
                self.apply_committed()?;
            }
        } else {
            // Duplicate rejections must not back off below a confirmed match.
            let floor = self.match_index.get(&response.follower_id).copied().unwrap_or(0) + 1;
            *next = next.saturating_sub(1).max(floor);
        }
        Ok(())
    }

    /// Move `commit_index` to the highest current-term index held by a
    /// majority. Returns true when it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let quorum = self.quorum_size();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
                    if replicas >= quorum {
                        tracing::debug!(node = %self.id, commit_index = n, "advancing commit index");
                        self.commit_index = n;
                        return true;
                    }
                }
                // Terms only decrease walking backwards.
                _ => break,
            }
            n -= 1;
        }
        false
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    /// Apply committed entries in index order, then compact the log if it has
    /// outgrown the snapshot threshold. Returns the number applied.
    pub fn apply_committed(&mut self) -> Result<usize> {
        let mut applied = 0;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                return Err(SyncError::StateMachine(format!(
                    "committed entry {} missing from log",
                    index
                )));
            };
            self.state_machine.apply(&entry.command, &entry.data)?;
            self.last_applied = index;
            self.stats.entries_applied += 1;
            applied += 1;
        }

        if self.log.len() > self.config.snapshot_threshold {
            self.take_snapshot()?;
        }
        Ok(applied)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot the state machine at `last_applied` and drop the covered log
    /// prefix.
    pub fn take_snapshot(&mut self) -> Result<Option<SnapshotMetadata>> {
        let index = self.last_applied;
        if index <= self.log.snapshot_index() {
            return Ok(None);
        }

        let term = self.log.term_at(index).ok_or_else(|| {
            SyncError::StateMachine(format!("applied entry {} missing from log", index))
        })?;
        let state = self.state_machine.snapshot()?;
        self.log.compact(index, term);

        let snapshot = Snapshot::new(index, term, state);
        let metadata = snapshot.metadata;
        self.snapshot = Some(snapshot);
        self.stats.snapshots += 1;

        tracing::info!(
            node = %self.id,
            last_included_index = index,
            last_included_term = term,
            "created snapshot"
        );
        Ok(Some(metadata))
    }

    pub fn handle_install_snapshot(
        &mut self,
        request: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if request.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                last_included_index: 0,
                follower_id: self.id.clone(),
            });
        }

        self.become_follower(request.term, Some(request.leader_id.clone()));

        let index = request.last_included_index;
        if index <= self.commit_index {
            tracing::debug!(
                node = %self.id,
                last_included_index = index,
                commit_index = self.commit_index,
                "ignoring stale snapshot"
            );
        } else {
            self.state_machine.restore(request.state.clone())?;
            self.log.reset_to_snapshot(index, request.last_included_term);
            self.commit_index = index;
            self.last_applied = index;
            self.snapshot = Some(Snapshot::new(
                index,
                request.last_included_term,
                request.state.clone(),
            ));
            self.stats.snapshots += 1;

            tracing::info!(
                node = %self.id,
                leader = %request.leader_id,
                last_included_index = index,
                "installed snapshot"
            );
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            last_included_index: index,
            follower_id: self.id.clone(),
        })
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        response: &InstallSnapshotResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            self.become_follower(response.term, None);
            return Ok(());
        }
        if !self.is_leader()
            || response.term != self.current_term
            || response.last_included_index == 0
        {
            return Ok(());
        }
        let Some(next) = self.next_index.get_mut(&response.follower_id) else {
            return Ok(());
        };

        let matched = self
            .match_index
            .entry(response.follower_id.clone())
            .or_insert(0);
        *matched = (*matched).max(response.last_included_index);
        *next = *matched + 1;

        if self.advance_commit_index() {
            self.apply_committed()?;
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handle any inbound RPC. Requests produce their reply; responses are
    /// absorbed.
    pub fn handle_message(&mut self, message: RaftMessage) -> Result<Option<RaftMessage>> {
        let reply = match message {
            RaftMessage::RequestVote(req) => {
                Some(RaftMessage::RequestVoteResponse(self.handle_vote_request(&req)))
            }
            RaftMessage::AppendEntries(req) => Some(RaftMessage::AppendEntriesResponse(
                self.handle_append_entries(&req)?,
            )),
            RaftMessage::InstallSnapshot(req) => Some(RaftMessage::InstallSnapshotResponse(
                self.handle_install_snapshot(&req)?,
            )),
            RaftMessage::RequestVoteResponse(resp) => {
                self.handle_vote_response(&resp);
                None
            }
            RaftMessage::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(&resp)?;
                None
            }
            RaftMessage::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(&resp)?;
                None
            }
        };
        Ok(reply)
    }

    // =========================================================================
    // Persistence and Diagnostics
    // =========================================================================

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            entries: self.log.entries().cloned().collect(),
            snapshot: self.snapshot.clone(),
        }
    }

    /// Rebuild from persisted state. The node restarts as a follower; entries
    /// after the snapshot are re-applied once a leader confirms the commit
    /// index.
    pub fn restore_from(&mut self, state: PersistentState) -> Result<()> {
        let (snapshot_index, snapshot_term) = match &state.snapshot {
            Some(snapshot) => {
                self.state_machine.restore(snapshot.state.clone())?;
                (snapshot.last_included_index(), snapshot.last_included_term())
            }
            None => (0, 0),
        };

        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = ReplicatedLog::from_parts(snapshot_index, snapshot_term, state.entries);
        self.snapshot = state.snapshot;
        self.commit_index = snapshot_index;
        self.last_applied = snapshot_index;
        self.role = NodeRole::Follower;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.election_reset = true;

        tracing::info!(
            node = %self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            snapshot_index,
            "restored persistent state"
        );
        Ok(())
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.id.clone(),
            role: self.role,
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            leader: self.leader_id.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            log_length: self.log.len(),
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
        }
    }

    pub fn stats(&self) -> RaftStats {
        self.stats
    }
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("current_term", &self.current_term)
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("last_log_index", &self.log.last_index())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
