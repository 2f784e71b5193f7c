//! Concord Sync - Distributed State Synchronization
//!
//! Causality tracking, conflict-free replicated data types, gossip
//! dissemination with failure detection, and Raft consensus for Concord
//! clusters. Every protocol core is a synchronous state machine; the service
//! modules run them as single-task actors over an injected transport.
//!
//! Key Features:
//! - Vector clocks and a per-entity clock registry
//! - GCounter, PNCounter, LWW-Element-Set, OR-Set and LWW-Register CRDTs
//! - CRDT registry with optional key-value persistence
//! - SWIM-style gossip with pluggable per-key merge
//! - Raft leader election, log replication and snapshots
//! - In-memory network for simulation and tests
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod vector_clock;
pub mod crdt;
pub mod registry;
pub mod persistence;
pub mod node;
pub mod transport;
pub mod timer;
pub mod gossip;
pub mod merge;
pub mod gossip_service;
pub mod log;
pub mod state;
pub mod raft;
pub mod raft_service;

pub use vector_clock::{CausalEvent, ClockOrdering, ClockRegistry, VectorClock};
pub use crdt::{Crdt, CrdtState, CrdtType, GCounter, LWWElementSet, LWWRegister, ORSet, PNCounter};
pub use registry::CrdtRegistry;
pub use persistence::{KeyValueStore, MemoryStore, StoreStats};
pub use node::{NodeRole, PeerRecord, PeerStatus};
pub use transport::{Envelope, InMemoryNetwork, Inbox, NetworkEndpoint, Transport};
pub use gossip::{GossipEngine, GossipMessage, GossipMessageType, GossipStats};
pub use merge::{CrdtMerge, LastWriteWins, StateMerge};
pub use gossip_service::{GossipHandle, GossipRequest, GossipService};
pub use log::{LogEntry, LogIndex, ReplicatedLog, Term};
pub use state::{KeyValueStateMachine, Snapshot, SnapshotMetadata, StateMachine};
pub use raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    PersistentState, RaftMessage, RaftNode, RaftStats, RaftStatus, VoteRequest, VoteResponse,
};
pub use raft_service::{RaftHandle, RaftRequest, RaftService};
pub use concord_common::{NodeId, Result, SyncError, TransportError};
