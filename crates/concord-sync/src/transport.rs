//! Concord Transport
//!
//! Request/response transport abstraction shared by Raft and gossip, and an
//! in-process network used for simulation and tests.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use async_trait::async_trait;
use concord_common::{NodeId, TransportError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// Transport Trait
// =============================================================================

/// Delivers a request to a peer and waits for its reply.
///
/// Callers wrap `send` in their own timeout; a transport may wait forever on
/// a peer that never answers.
#[async_trait]
pub trait Transport<M: Send + 'static>: Send + Sync {
    async fn send(&self, to: &NodeId, message: M) -> Result<M, TransportError>;
}

// =============================================================================
// Envelope
// =============================================================================

/// An inbound request together with the channel its reply goes back on.
#[derive(Debug)]
pub struct Envelope<M> {
    pub from: NodeId,
    pub message: M,
    pub reply: oneshot::Sender<M>,
}

impl<M> Envelope<M> {
    /// Answer the request. A sender that gave up waiting is not an error.
    pub fn respond(self, message: M) {
        let _ = self.reply.send(message);
    }
}

/// Receiving side of a node's registration on an [`InMemoryNetwork`].
pub type Inbox<M> = mpsc::UnboundedReceiver<Envelope<M>>;

// =============================================================================
// In-Memory Network
// =============================================================================

struct NetworkInner<M> {
    routes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope<M>>>>,
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
    isolated: RwLock<HashSet<NodeId>>,
}

/// Process-local network. Clones share the same routing table, so a test can
/// keep one handle to cut and heal links while nodes hold endpoints.
pub struct InMemoryNetwork<M> {
    inner: Arc<NetworkInner<M>>,
}

impl<M> Clone for InMemoryNetwork<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Send + 'static> Default for InMemoryNetwork<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> InMemoryNetwork<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                routes: RwLock::new(HashMap::new()),
                blocked: RwLock::new(HashSet::new()),
                isolated: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Attach a node and return its inbox. Registering an id again replaces
    /// the previous inbox.
    pub fn register(&self, id: impl Into<NodeId>) -> Inbox<M> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.write().insert(id.into(), tx);
        rx
    }

    pub fn deregister(&self, id: &NodeId) {
        self.inner.routes.write().remove(id);
    }

    /// A transport that sends as `id`.
    pub fn endpoint(&self, id: impl Into<NodeId>) -> NetworkEndpoint<M> {
        NetworkEndpoint {
            id: id.into(),
            network: self.clone(),
        }
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.routes.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let mut blocked = self.inner.blocked.write();
        blocked.insert((a.clone(), b.clone()));
        blocked.insert((b.clone(), a.clone()));
    }

    /// Cut every link between the two groups.
    pub fn split(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.partition(a, b);
            }
        }
    }

    /// Cut `id` off from every other node.
    pub fn isolate(&self, id: &NodeId) {
        self.inner.isolated.write().insert(id.clone());
    }

    /// Restore every cut link.
    pub fn heal(&self) {
        self.inner.blocked.write().clear();
        self.inner.isolated.write().clear();
    }

    pub fn is_blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        {
            let isolated = self.inner.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return true;
            }
        }
        self.inner
            .blocked
            .read()
            .contains(&(from.clone(), to.clone()))
    }

    async fn deliver(&self, from: &NodeId, to: &NodeId, message: M) -> Result<M, TransportError> {
        if self.is_blocked(from, to) {
            return Err(TransportError::Unreachable(to.clone()));
        }

        let route = self.inner.routes.read().get(to).cloned();
        let route = route.ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        let (reply, response) = oneshot::channel();
        route
            .send(Envelope {
                from: from.clone(),
                message,
                reply,
            })
            .map_err(|_| TransportError::Closed)?;

        let message = response.await.map_err(|_| TransportError::NoResponse)?;

        // A link cut while the request was in flight loses the reply.
        if self.is_blocked(to, from) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        Ok(message)
    }
}

/// One node's view of an [`InMemoryNetwork`].
pub struct NetworkEndpoint<M> {
    id: NodeId,
    network: InMemoryNetwork<M>,
}

impl<M> NetworkEndpoint<M> {
    pub fn id(&self) -> &NodeId {
        &self.id
    }
}

impl<M> Clone for NetworkEndpoint<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            network: self.network.clone(),
        }
    }
}

#[async_trait]
impl<M: Send + 'static> Transport<M> for NetworkEndpoint<M> {
    async fn send(&self, to: &NodeId, message: M) -> Result<M, TransportError> {
        self.network.deliver(&self.id, to, message).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_echo(mut inbox: Inbox<String>, suffix: &'static str) {
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let reply = format!("{}{}", envelope.message, suffix);
                envelope.respond(reply);
            }
        });
    }

    #[tokio::test]
    async fn test_request_reply() {
        let network = InMemoryNetwork::<String>::new();
        spawn_echo(network.register("b"), "-ack");
        let _a = network.register("a");

        let a = network.endpoint("a");
        let reply = a.send(&NodeId::new("b"), "ping".to_string()).await.unwrap();
        assert_eq!(reply, "ping-ack");
        assert_eq!(network.nodes(), vec![NodeId::new("a"), NodeId::new("b")]);
    }

    #[tokio::test]
    async fn test_envelope_carries_sender() {
        let network = InMemoryNetwork::<String>::new();
        let mut inbox = network.register("b");
        tokio::spawn(async move {
            if let Some(envelope) = inbox.recv().await {
                let from = envelope.from.to_string();
                envelope.respond(from);
            }
        });

        let reply = network
            .endpoint("a")
            .send(&NodeId::new("b"), String::new())
            .await
            .unwrap();
        assert_eq!(reply, "a");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let network = InMemoryNetwork::<String>::new();
        let result = network
            .endpoint("a")
            .send(&NodeId::new("ghost"), "hi".to_string())
            .await;
        assert_eq!(result, Err(TransportError::Unreachable(NodeId::new("ghost"))));
    }

    #[tokio::test]
    async fn test_deregistered_peer_is_unreachable() {
        let network = InMemoryNetwork::<String>::new();
        let _inbox = network.register("b");
        network.deregister(&NodeId::new("b"));

        assert!(network.nodes().is_empty());
        let result = network
            .endpoint("a")
            .send(&NodeId::new("b"), "hi".to_string())
            .await;
        assert_eq!(result, Err(TransportError::Unreachable(NodeId::new("b"))));
    }

    #[tokio::test]
    async fn test_partition_isolate_and_heal() {
        let network = InMemoryNetwork::<String>::new();
        spawn_echo(network.register("b"), "");
        spawn_echo(network.register("c"), "");
        let a = network.endpoint("a");
        let (b, c) = (NodeId::new("b"), NodeId::new("c"));

        network.partition(&NodeId::new("a"), &b);
        assert!(a.send(&b, "x".into()).await.is_err());
        assert!(a.send(&c, "x".into()).await.is_ok());
        assert!(network.is_blocked(&b, &NodeId::new("a")));

        network.isolate(&c);
        assert!(a.send(&c, "x".into()).await.is_err());

        network.heal();
        assert!(a.send(&b, "x".into()).await.is_ok());
        assert!(a.send(&c, "x".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_reply_is_no_response() {
        let network = InMemoryNetwork::<String>::new();
        let mut inbox = network.register("b");
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                drop(envelope);
            }
        });

        let result = network
            .endpoint("a")
            .send(&NodeId::new("b"), "x".to_string())
            .await;
        assert_eq!(result, Err(TransportError::NoResponse));
    }

    #[tokio::test]
    async fn test_closed_inbox() {
        let network = InMemoryNetwork::<String>::new();
        drop(network.register("b"));

        let result = network
            .endpoint("a")
            .send(&NodeId::new("b"), "x".to_string())
            .await;
        assert_eq!(result, Err(TransportError::Closed));
    }
}
