//! Concord Raft Service
//!
//! Runs a [`RaftNode`] as an actor on its own task. The loop owns the node and
//! its timers, answers inbound RPCs, fans RPCs out concurrently and feeds the
//! results back through an internal channel, so the node itself is only ever
//! touched from one place.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::log::{LogIndex, Term};
use crate::raft::{PersistentState, RaftMessage, RaftNode, RaftStats, RaftStatus};
use crate::timer::{self, Timer};
use crate::transport::{Envelope, Inbox, Transport};
use concord_common::{NodeId, Result, SyncError, TransportError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// =============================================================================
// Requests and Events
// =============================================================================

type Reply<T> = oneshot::Sender<T>;

/// Requests a [`RaftHandle`] sends to its service.
#[derive(Debug)]
pub enum RaftRequest {
    Propose {
        command: String,
        data: Value,
        reply: Reply<Result<LogIndex>>,
    },
    Replicate {
        command: String,
        data: Value,
        reply: Reply<Result<LogIndex>>,
    },
    Status(Reply<RaftStatus>),
    Stats(Reply<RaftStats>),
    StateMachineSnapshot(Reply<Result<Value>>),
    PersistentState(Reply<PersistentState>),
    Shutdown,
}

/// Outcome of an outbound RPC, posted back to the loop. Replication RPCs
/// carry the sequence number they were sent under.
struct RpcResult {
    peer: NodeId,
    replication: Option<u64>,
    result: std::result::Result<RaftMessage, TransportError>,
}

// =============================================================================
// Raft Handle
// =============================================================================

/// Cloneable client for a running [`RaftService`].
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    requests: mpsc::UnboundedSender<RaftRequest>,
}

impl RaftHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> RaftRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| SyncError::ServiceStopped(self.id.to_string()))?;
        response
            .await
            .map_err(|_| SyncError::ServiceStopped(self.id.to_string()))
    }

    /// Append a command on the leader and return its index without waiting
    /// for commitment.
    pub async fn propose(&self, command: impl Into<String>, data: Value) -> Result<LogIndex> {
        let command = command.into();
        self.request(|reply| RaftRequest::Propose {
            command,
            data,
            reply,
        })
        .await?
    }

    /// Append a command and wait until the leader has applied it.
    pub async fn replicate(&self, command: impl Into<String>, data: Value) -> Result<LogIndex> {
        let command = command.into();
        self.request(|reply| RaftRequest::Replicate {
            command,
            data,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        self.request(RaftRequest::Status).await
    }

    pub async fn stats(&self) -> Result<RaftStats> {
        self.request(RaftRequest::Stats).await
    }

    pub async fn state_machine_snapshot(&self) -> Result<Value> {
        self.request(RaftRequest::StateMachineSnapshot).await?
    }

    pub async fn persistent_state(&self) -> Result<PersistentState> {
        self.request(RaftRequest::PersistentState).await
    }

    /// Stop the service. Pending `replicate` calls fail with
    /// `ServiceStopped`.
    pub fn shutdown(&self) {
        let _ = self.requests.send(RaftRequest::Shutdown);
    }
}

// =============================================================================
// Raft Service
// =============================================================================

pub struct RaftService {
    node: RaftNode,
    transport: Arc<dyn Transport<RaftMessage>>,
    election: Timer,
    heartbeat: Timer,
    pending: BTreeMap<LogIndex, (Term, Reply<Result<LogIndex>>)>,
    /// Latest outstanding replication RPC per peer.
    in_flight: HashMap<NodeId, u64>,
    next_sequence: u64,
    events: mpsc::UnboundedSender<RpcResult>,
    rng: StdRng,
}

impl RaftService {
    /// Start the actor for `node`, reading requests from `inbound` and
    /// sending through `transport`.
    pub fn spawn(
        node: RaftNode,
        transport: Arc<dyn Transport<RaftMessage>>,
        inbound: Inbox<RaftMessage>,
    ) -> (RaftHandle, JoinHandle<()>) {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let handle = RaftHandle {
            id: node.id().clone(),
            requests,
        };
        let service = Self {
            node,
            transport,
            election: Timer::new(),
            heartbeat: Timer::new(),
            pending: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_sequence: 0,
            events,
            rng: StdRng::from_entropy(),
        };

        let task = tokio::spawn(service.run(inbound, request_rx, event_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut inbound: Inbox<RaftMessage>,
        mut requests: mpsc::UnboundedReceiver<RaftRequest>,
        mut events: mpsc::UnboundedReceiver<RpcResult>,
    ) {
        tracing::info!(node = %self.node.id(), peers = self.node.cluster_size() - 1, "raft service started");
        self.arm_election();

        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                Some(event) = events.recv() => self.on_rpc_result(event),
                request = requests.recv() => match request {
                    Some(RaftRequest::Shutdown) | None => break,
                    Some(request) => self.on_request(request),
                },
                _ = timer::expired(self.election.deadline()) => self.on_election_timeout(),
                _ = timer::expired(self.heartbeat.deadline()) => self.on_heartbeat(),
            }

            self.sync_timers();
            self.resolve_pending();
        }

        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(SyncError::ServiceStopped(self.node.id().to_string())));
        }
        tracing::info!(node = %self.node.id(), term = self.node.current_term(), "raft service stopped");
    }

    // =========================================================================
    // Event Handlers
    // =========================================================================

    fn on_envelope(&mut self, envelope: Envelope<RaftMessage>) {
        let Envelope { from, message, reply } = envelope;
        match self.node.handle_message(message) {
            Ok(Some(response)) => {
                let _ = reply.send(response);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(node = %self.node.id(), from = %from, error = %e, "failed to handle raft message");
            }
        }
    }

    fn on_rpc_result(&mut self, event: RpcResult) {
        let RpcResult {
            peer,
            replication,
            result,
        } = event;
        if let Some(sequence) = replication {
            if self.in_flight.get(&peer) == Some(&sequence) {
                self.in_flight.remove(&peer);
            }
        }

        match result {
            Ok(message) => {
                if let Err(e) = self.node.handle_message(message) {
                    tracing::error!(node = %self.node.id(), peer = %peer, error = %e, "failed to handle raft response");
                    return;
                }
                // Keep a lagging follower busy instead of waiting a heartbeat.
                if replication.is_some() && self.node.is_leader() && self.lags(&peer) {
                    self.replicate_to(&peer, false);
                }
            }
            Err(e) => {
                tracing::debug!(node = %self.node.id(), peer = %peer, error = %e, "raft rpc failed");
            }
        }
    }

    fn on_request(&mut self, request: RaftRequest) {
        match request {
            RaftRequest::Propose {
                command,
                data,
                reply,
            } => {
                let result = self.node.propose(command, data);
                if result.is_ok() {
                    self.broadcast_append(false);
                }
                let _ = reply.send(result);
            }
            RaftRequest::Replicate {
                command,
                data,
                reply,
            } => match self.node.propose(command, data) {
                Ok(index) => {
                    self.pending
                        .insert(index, (self.node.current_term(), reply));
                    self.broadcast_append(false);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            RaftRequest::Status(reply) => {
                let _ = reply.send(self.node.status());
            }
            RaftRequest::Stats(reply) => {
                let _ = reply.send(self.node.stats());
            }
            RaftRequest::StateMachineSnapshot(reply) => {
                let _ = reply.send(self.node.state_machine_snapshot());
            }
            RaftRequest::PersistentState(reply) => {
                let _ = reply.send(self.node.persistent_state());
            }
            RaftRequest::Shutdown => {}
        }
    }

    fn on_election_timeout(&mut self) {
        self.election.cancel();
        if let Some(request) = self.node.start_election() {
            let peers: Vec<NodeId> = self.node.peers().cloned().collect();
            for peer in peers {
                self.spawn_rpc(peer, RaftMessage::RequestVote(request.clone()), None);
            }
        }
    }

    fn on_heartbeat(&mut self) {
        self.heartbeat.arm(self.node.config().heartbeat_interval);
        self.broadcast_append(true);
    }

    // =========================================================================
    // Replication
    // =========================================================================

    fn lags(&self, peer: &NodeId) -> bool {
        self.node
            .next_index(peer)
            .map_or(false, |next| next <= self.node.log().last_index())
    }

    /// Send to every peer. With `force`, peers with an outstanding RPC are
    /// sent to as well.
    fn broadcast_append(&mut self, force: bool) {
        if !self.node.is_leader() {
            return;
        }
        let peers: Vec<NodeId> = self.node.peers().cloned().collect();
        for peer in peers {
            self.replicate_to(&peer, force);
        }
    }

    fn replicate_to(&mut self, peer: &NodeId, force: bool) {
        if !force && self.in_flight.contains_key(peer) {
            return;
        }
        if let Some(message) = self.node.replication_message(peer) {
            self.next_sequence += 1;
            self.in_flight.insert(peer.clone(), self.next_sequence);
            self.spawn_rpc(peer.clone(), message, Some(self.next_sequence));
        }
    }

    fn spawn_rpc(&self, peer: NodeId, message: RaftMessage, replication: Option<u64>) {
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let rpc_timeout = self.node.config().rpc_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(rpc_timeout, transport.send(&peer, message)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = events.send(RpcResult {
                peer,
                replication,
                result,
            });
        });
    }

    // =========================================================================
    // Timers and Proposals
    // =========================================================================

    fn arm_election(&mut self) {
        let timeout = self.node.random_election_timeout(&mut self.rng);
        self.election.arm(timeout);
    }

    fn sync_timers(&mut self) {
        let reset = self.node.take_election_reset();
        if self.node.is_leader() {
            self.election.cancel();
            if !self.heartbeat.is_armed() {
                self.heartbeat.arm(Duration::ZERO);
            }
        } else {
            self.heartbeat.cancel();
            if reset || !self.election.is_armed() {
                self.arm_election();
            }
        }
    }

    fn resolve_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let applied = self.node.last_applied();
        let ready: Vec<LogIndex> = self.pending.range(..=applied).map(|(i, _)| *i).collect();
        for index in ready {
            if let Some((term, reply)) = self.pending.remove(&index) {
                let outcome = match self.node.log().term_at(index) {
                    Some(actual) if actual != term => Err(SyncError::ProposalDropped(index)),
                    _ => Ok(index),
                };
                let _ = reply.send(outcome);
            }
        }

        let current_term = self.node.current_term();
        let leading = self.node.is_leader();
        let stale: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(_, (term, _))| !leading || *term != current_term)
            .map(|(i, _)| *i)
            .collect();
        for index in stale {
            if let Some((_, reply)) = self.pending.remove(&index) {
                let _ = reply.send(Err(SyncError::NotLeader {
                    leader: self.node.leader().cloned(),
                }));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryNetwork, NetworkEndpoint};
    use async_trait::async_trait;
    use concord_common::config::RaftConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn wait_for_leader(handle: &RaftHandle) {
        for _ in 0..100 {
            if handle.status().await.unwrap().role == crate::node::NodeRole::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never became leader", handle.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_service() {
        let network = InMemoryNetwork::<RaftMessage>::new();
        let inbox = network.register("solo");
        let node = RaftNode::new("solo", Vec::new(), RaftConfig::default());
        let (handle, task) = RaftService::spawn(node, Arc::new(network.endpoint("solo")), inbox);

        wait_for_leader(&handle).await;
        let index = handle.replicate("greeting", json!("hello")).await.unwrap();
        assert_eq!(index, 1);

        let state = handle.state_machine_snapshot().await.unwrap();
        assert_eq!(state["greeting"], "hello");
        assert_eq!(handle.stats().await.unwrap().entries_applied, 1);

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(
            handle.status().await,
            Err(SyncError::ServiceStopped(_))
        ));
    }

    /// Swallows the first AppendEntries sent after it is armed.
    struct DropOnceEndpoint {
        inner: NetworkEndpoint<RaftMessage>,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport<RaftMessage> for DropOnceEndpoint {
        async fn send(
            &self,
            to: &NodeId,
            message: RaftMessage,
        ) -> std::result::Result<RaftMessage, TransportError> {
            if matches!(message, RaftMessage::AppendEntries(_)) && self.armed.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.send(to, message).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_append_does_not_depose_leader() {
        let network = InMemoryNetwork::<RaftMessage>::new();
        let armed = Arc::new(AtomicBool::new(false));
        let ids: Vec<NodeId> = ["n1", "n2", "n3"].iter().map(|id| NodeId::new(*id)).collect();
        let handles: Vec<RaftHandle> = ids
            .iter()
            .map(|id| {
                let node = RaftNode::new(id.clone(), ids.iter().cloned(), RaftConfig::default());
                let inbox = network.register(id.clone());
                let transport = DropOnceEndpoint {
                    inner: network.endpoint(id.clone()),
                    armed: Arc::clone(&armed),
                };
                RaftService::spawn(node, Arc::new(transport), inbox).0
            })
            .collect();

        let mut leader = None;
        for _ in 0..100 {
            for handle in &handles {
                if handle.status().await.unwrap().role == crate::node::NodeRole::Leader {
                    leader = Some(handle.clone());
                }
            }
            if leader.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leader = leader.expect("no leader elected");
        let term = leader.status().await.unwrap().current_term;

        armed.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!armed.load(Ordering::SeqCst));

        for handle in &handles {
            let status = handle.status().await.unwrap();
            assert_eq!(status.current_term, term, "{} changed term", handle.id());
        }
        assert!(leader.status().await.unwrap().role == crate::node::NodeRole::Leader);
        for handle in &handles {
            handle.shutdown();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_propose_before_election_is_rejected() {
        let network = InMemoryNetwork::<RaftMessage>::new();
        let inbox = network.register("n1");
        let node = RaftNode::new("n1", vec![NodeId::new("n2")], RaftConfig::default());
        let (handle, _task) = RaftService::spawn(node, Arc::new(network.endpoint("n1")), inbox);

        let result = handle.propose("k", json!(1)).await;
        assert!(matches!(result, Err(SyncError::NotLeader { leader: None })));
        handle.shutdown();
    }
}
