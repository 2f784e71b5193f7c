//! Concord Gossip Service
//!
//! Runs a [`GossipEngine`] as an actor with its three periodic activities:
//! gossip rounds, heartbeats and failure detection. Exchanges run on spawned
//! tasks and report back through an internal channel; a failed or timed-out
//! exchange only counts against the peer.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::gossip::{GossipEngine, GossipMessage, GossipMessageType, GossipStats};
use crate::merge::{LastWriteWins, StateMerge};
use crate::timer::{self, Timer};
use crate::transport::{Envelope, Inbox, Transport};
use concord_common::{NodeId, Result, SyncError, TransportError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply<T> = oneshot::Sender<T>;
type EngineCall<S> = Box<dyn FnOnce(&mut GossipEngine<S>) + Send>;

/// Requests a [`GossipHandle`] sends to its service.
pub enum GossipRequest<S: StateMerge> {
    SetState {
        key: String,
        value: Value,
        reply: Reply<()>,
    },
    GetState {
        key: String,
        reply: Reply<Option<Value>>,
    },
    AllState(Reply<BTreeMap<String, Value>>),
    Stats(Reply<GossipStats>),
    AddPeer {
        id: NodeId,
        address: String,
        metadata: BTreeMap<String, String>,
        reply: Reply<bool>,
    },
    Call(EngineCall<S>),
    Shutdown,
}

struct ExchangeResult {
    peer: NodeId,
    result: std::result::Result<GossipMessage, TransportError>,
}

/// Wall-clock instant that follows tokio's clock, paused or not.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

// =============================================================================
// Gossip Handle
// =============================================================================

/// Cloneable client for a running [`GossipService`].
pub struct GossipHandle<S: StateMerge = LastWriteWins> {
    id: NodeId,
    requests: mpsc::UnboundedSender<GossipRequest<S>>,
}

impl<S: StateMerge> Clone for GossipHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            requests: self.requests.clone(),
        }
    }
}

impl<S: StateMerge> GossipHandle<S> {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    fn stopped(&self) -> SyncError {
        SyncError::ServiceStopped(self.id.to_string())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> GossipRequest<S>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests.send(make(reply)).map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    pub async fn set_state(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        self.request(|reply| GossipRequest::SetState { key, value, reply })
            .await
    }

    pub async fn get_state(&self, key: impl Into<String>) -> Result<Option<Value>> {
        let key = key.into();
        self.request(|reply| GossipRequest::GetState { key, reply })
            .await
    }

    pub async fn all_state(&self) -> Result<BTreeMap<String, Value>> {
        self.request(GossipRequest::AllState).await
    }

    pub async fn stats(&self) -> Result<GossipStats> {
        self.request(GossipRequest::Stats).await
    }

    pub async fn add_peer(
        &self,
        id: impl Into<NodeId>,
        address: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<bool> {
        let (id, address) = (id.into(), address.into());
        self.request(|reply| GossipRequest::AddPeer {
            id,
            address,
            metadata,
            reply,
        })
        .await
    }

    /// Run `f` against the engine on the service task and return its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut GossipEngine<S>) -> T + Send + 'static,
    {
        self.request(|reply| {
            GossipRequest::Call(Box::new(move |engine: &mut GossipEngine<S>| {
                let _ = reply.send(f(engine));
            }))
        })
        .await
    }

    pub fn shutdown(&self) {
        let _ = self.requests.send(GossipRequest::Shutdown);
    }
}

// =============================================================================
// Gossip Service
// =============================================================================

pub struct GossipService<S: StateMerge = LastWriteWins> {
    engine: GossipEngine<S>,
    transport: Arc<dyn Transport<GossipMessage>>,
    gossip_timer: Timer,
    heartbeat_timer: Timer,
    detection_timer: Timer,
    events: mpsc::UnboundedSender<ExchangeResult>,
    rng: StdRng,
}

impl<S: StateMerge> GossipService<S> {
    pub fn spawn(
        engine: GossipEngine<S>,
        transport: Arc<dyn Transport<GossipMessage>>,
        inbound: Inbox<GossipMessage>,
    ) -> (GossipHandle<S>, JoinHandle<()>) {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let handle = GossipHandle {
            id: engine.node_id().clone(),
            requests,
        };
        let service = Self {
            engine,
            transport,
            gossip_timer: Timer::new(),
            heartbeat_timer: Timer::new(),
            detection_timer: Timer::new(),
            events,
            rng: StdRng::from_entropy(),
        };

        let task = tokio::spawn(service.run(inbound, request_rx, event_rx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut inbound: Inbox<GossipMessage>,
        mut requests: mpsc::UnboundedReceiver<GossipRequest<S>>,
        mut events: mpsc::UnboundedReceiver<ExchangeResult>,
    ) {
        let config = self.engine.config().clone();
        self.gossip_timer.arm(config.gossip_interval);
        self.heartbeat_timer.arm(config.heartbeat_interval);
        self.detection_timer.arm(config.suspect_timeout);
        tracing::info!(node = %self.engine.node_id(), address = self.engine.address(), "gossip service started");

        loop {
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => break,
                },
                Some(event) = events.recv() => self.on_exchange_result(event),
                request = requests.recv() => match request {
                    Some(GossipRequest::Shutdown) | None => break,
                    Some(request) => self.on_request(request),
                },
                _ = timer::expired(self.gossip_timer.deadline()) => {
                    self.gossip_timer.arm(config.gossip_interval);
                    self.gossip_round();
                }
                _ = timer::expired(self.heartbeat_timer.deadline()) => {
                    self.heartbeat_timer.arm(config.heartbeat_interval);
                    self.heartbeat();
                }
                _ = timer::expired(self.detection_timer.deadline()) => {
                    self.detection_timer.arm(config.suspect_timeout);
                    self.engine.detect_failures(now());
                }
            }
        }

        tracing::info!(
            node = %self.engine.node_id(),
            rounds = self.engine.rounds_completed(),
            "gossip service stopped"
        );
    }

    fn on_envelope(&mut self, envelope: Envelope<GossipMessage>) {
        let Envelope { from, message, reply } = envelope;
        match self.engine.handle_message(message, now()) {
            Ok(Some(response)) => {
                let _ = reply.send(response);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(node = %self.engine.node_id(), from = %from, error = %e, "failed to handle gossip message");
            }
        }
    }

    fn on_exchange_result(&mut self, event: ExchangeResult) {
        match event.result {
            Ok(reply) => {
                if let Err(e) = self.engine.handle_message(reply, now()) {
                    tracing::error!(node = %self.engine.node_id(), peer = %event.peer, error = %e, "failed to merge gossip reply");
                }
            }
            Err(e) => {
                tracing::debug!(node = %self.engine.node_id(), peer = %event.peer, error = %e, "gossip exchange failed");
                self.engine.record_failure(&event.peer);
            }
        }
    }

    fn on_request(&mut self, request: GossipRequest<S>) {
        match request {
            GossipRequest::SetState { key, value, reply } => {
                self.engine.set_state(key, value);
                let _ = reply.send(());
            }
            GossipRequest::GetState { key, reply } => {
                let _ = reply.send(self.engine.get_state(&key).cloned());
            }
            GossipRequest::AllState(reply) => {
                let _ = reply.send(self.engine.all_state().clone());
            }
            GossipRequest::Stats(reply) => {
                let _ = reply.send(self.engine.stats());
            }
            GossipRequest::AddPeer {
                id,
                address,
                metadata,
                reply,
            } => {
                let _ = reply.send(self.engine.add_peer(id, address, metadata, now()));
            }
            GossipRequest::Call(f) => f(&mut self.engine),
            GossipRequest::Shutdown => {}
        }
    }

    fn gossip_round(&mut self) {
        let targets = self.engine.select_gossip_targets(&mut self.rng);
        if targets.is_empty() {
            return;
        }
        for peer in targets {
            let message = self.engine.make_message(&peer, GossipMessageType::PushPull);
            self.spawn_exchange(peer, message);
        }
        self.engine.complete_round();
    }

    fn heartbeat(&mut self) {
        for peer in self.engine.heartbeat_targets() {
            let message = self.engine.make_message(&peer, GossipMessageType::Ping);
            self.spawn_exchange(peer, message);
        }
    }

    fn spawn_exchange(&self, peer: NodeId, message: GossipMessage) {
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let rpc_timeout = self.engine.config().rpc_timeout;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(rpc_timeout, transport.send(&peer, message)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            let _ = events.send(ExchangeResult { peer, result });
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PeerStatus;
    use crate::transport::InMemoryNetwork;
    use concord_common::config::GossipConfig;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_handle_round_trip() {
        let network = InMemoryNetwork::<GossipMessage>::new();
        let inbox = network.register("a");
        let engine = GossipEngine::new("a", "a:1", GossipConfig::default());
        let (handle, task) = GossipService::spawn(engine, Arc::new(network.endpoint("a")), inbox);

        handle.set_state("k", json!(1)).await.unwrap();
        assert_eq!(handle.get_state("k").await.unwrap(), Some(json!(1)));
        assert!(!handle.add_peer("a", "a:1", BTreeMap::new()).await.unwrap());
        assert!(handle.add_peer("b", "b:1", BTreeMap::new()).await.unwrap());

        let ticks = handle.call(|engine| engine.clock().get(engine.node_id())).await.unwrap();
        assert_eq!(ticks, 1);
        assert_eq!(handle.all_state().await.unwrap().len(), 1);

        handle.shutdown();
        task.await.unwrap();
        assert!(handle.stats().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_is_suspected() {
        let network = InMemoryNetwork::<GossipMessage>::new();
        let inbox = network.register("a");
        let config = GossipConfig::default()
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_gossip_interval(Duration::from_millis(100));
        let engine = GossipEngine::new("a", "a:1", config);
        let (handle, _task) = GossipService::spawn(engine, Arc::new(network.endpoint("a")), inbox);

        handle.add_peer("ghost", "nowhere", BTreeMap::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.suspect_peers, 1);
        assert!(stats.failed_exchanges >= 3);
        let status = handle
            .call(|engine| engine.peer(&NodeId::new("ghost")).map(|p| p.status))
            .await
            .unwrap();
        assert_eq!(status, Some(PeerStatus::Suspect));
        handle.shutdown();
    }
}
