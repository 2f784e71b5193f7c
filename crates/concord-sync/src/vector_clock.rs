//! Concord Vector Clocks
//!
//! Vector clocks for causal ordering of events across nodes, plus a
//! per-node registry that tracks one clock per entity and orders batches of
//! events causally.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use concord_common::{NodeId, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

// =============================================================================
// Vector Clock
// =============================================================================

/// A vector clock owned by a single node.
///
/// Only the owner advances its own entry. Entries for other nodes rise only
/// through `update` and `merge`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorClock {
    node_id: NodeId,
    clock: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create a clock for `node_id` with its own counter at zero.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        let mut clock = BTreeMap::new();
        clock.insert(node_id.clone(), 0);
        Self { node_id, clock }
    }

    /// Create a clock seeded with existing counters.
    pub fn with_counters(
        node_id: impl Into<NodeId>,
        counters: impl IntoIterator<Item = (NodeId, u64)>,
    ) -> Self {
        let mut clock = Self::new(node_id);
        for (node, value) in counters {
            clock.clock.insert(node, value);
        }
        clock
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Record a local event.
    pub fn increment(&mut self) -> u64 {
        let counter = self.clock.entry(self.node_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Message-receipt rule: pointwise max with `remote`, then tick.
    pub fn update(&mut self, remote: &VectorClock) {
        self.absorb(remote);
        self.increment();
    }

    /// Pointwise max with `other` without ticking, returned as a new clock
    /// owned by this node.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.absorb(other);
        merged
    }

    fn absorb(&mut self, other: &VectorClock) {
        for (node, &value) in &other.clock {
            let current = self.clock.entry(node.clone()).or_insert(0);
            *current = (*current).max(value);
        }
    }

    /// Compare over the union of node ids, missing entries counting as zero.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut has_less = false;
        let mut has_greater = false;

        for node in self.clock.keys().chain(other.clock.keys()) {
            let ours = self.get(node);
            let theirs = other.get(node);
            if ours < theirs {
                has_less = true;
            } else if ours > theirs {
                has_greater = true;
            }
        }

        match (has_less, has_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    pub fn happens_after(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Counter for `node`, zero when unknown.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.clock.get(node).copied().unwrap_or(0)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.clock.keys()
    }

    pub fn counters(&self) -> &BTreeMap<NodeId, u64> {
        &self.clock
    }

    /// Sum of all counters. Used only to break ties between concurrent events.
    pub fn lamport_timestamp(&self) -> u64 {
        self.clock.values().sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "nodeId": self.node_id,
            "clock": self.clock,
        })
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse the `{a:1,b:2}` form produced by `Display`.
    pub fn parse(text: &str, node_id: impl Into<NodeId>) -> Result<Self> {
        let body = text
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| SyncError::Decode(format!("malformed vector clock: {}", text)))?;

        let mut counters = Vec::new();
        for entry in body.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (node, value) = entry
                .rsplit_once(':')
                .ok_or_else(|| SyncError::Decode(format!("malformed clock entry: {}", entry)))?;
            let value = value
                .trim()
                .parse::<u64>()
                .map_err(|e| SyncError::Decode(format!("bad counter in '{}': {}", entry, e)))?;
            counters.push((NodeId::new(node.trim()), value));
        }

        Ok(Self::with_counters(node_id, counters))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node, value)) in self.clock.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", node, value)?;
        }
        write!(f, "}}")
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }
}

impl Eq for VectorClock {}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Before => Some(Ordering::Less),
            ClockOrdering::After => Some(Ordering::Greater),
            ClockOrdering::Concurrent => None,
        }
    }
}

// =============================================================================
// Clock Ordering
// =============================================================================

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

// =============================================================================
// Causal Events
// =============================================================================

/// An application event stamped with the clock of the entity that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalEvent<T> {
    pub entity_id: String,
    pub clock: VectorClock,
    pub data: T,
}

impl<T> CausalEvent<T> {
    pub fn new(entity_id: impl Into<String>, clock: VectorClock, data: T) -> Self {
        Self {
            entity_id: entity_id.into(),
            clock,
            data,
        }
    }
}

// =============================================================================
// Clock Registry
// =============================================================================

/// Tracks one vector clock per entity on behalf of a single node.
#[derive(Debug, Clone)]
pub struct ClockRegistry {
    node_id: NodeId,
    clocks: HashMap<String, VectorClock>,
}

impl ClockRegistry {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            clocks: HashMap::new(),
        }
    }

    /// Clock for `entity_id`, created on first use.
    pub fn clock(&mut self, entity_id: &str) -> &mut VectorClock {
        let node_id = &self.node_id;
        self.clocks
            .entry(entity_id.to_string())
            .or_insert_with(|| VectorClock::new(node_id.clone()))
    }

    pub fn get(&self, entity_id: &str) -> Option<&VectorClock> {
        self.clocks.get(entity_id)
    }

    pub fn increment(&mut self, entity_id: &str) -> VectorClock {
        let clock = self.clock(entity_id);
        clock.increment();
        clock.clone()
    }

    pub fn update(&mut self, entity_id: &str, remote: &VectorClock) -> VectorClock {
        let clock = self.clock(entity_id);
        clock.update(remote);
        clock.clone()
    }

    /// Compare two tracked entities. Unknown entities compare as fresh clocks.
    pub fn compare(&self, first: &str, second: &str) -> ClockOrdering {
        let fresh = VectorClock::new(self.node_id.clone());
        let a = self.clocks.get(first).unwrap_or(&fresh);
        let b = self.clocks.get(second).unwrap_or(&fresh);
        a.compare(b)
    }

    /// Group indices of events whose clocks are concurrent with the first
    /// member of the group. Singleton groups are omitted.
    pub fn detect_concurrent<T>(&self, events: &[CausalEvent<T>]) -> Vec<Vec<usize>> {
        let mut groups = Vec::new();

        for i in 0..events.len() {
            let mut group = vec![i];
            for j in (i + 1)..events.len() {
                if events[i].clock.is_concurrent(&events[j].clock) {
                    group.push(j);
                }
            }
            if group.len() > 1 {
                groups.push(group);
            }
        }

        groups
    }

    /// Stable causal sort.
    ///
    /// Causally ordered pairs always have strictly ordered Lamport timestamps,
    /// so the comparator is a total preorder.
    pub fn causal_sort<T>(&self, mut events: Vec<CausalEvent<T>>) -> Vec<CausalEvent<T>> {
        events.sort_by(|a, b| match a.clock.compare(&b.clock) {
            ClockOrdering::Before => Ordering::Less,
            ClockOrdering::After => Ordering::Greater,
            _ => a
                .clock
                .lamport_timestamp()
                .cmp(&b.clock.lamport_timestamp()),
        });
        events
    }

    /// Serialize every tracked clock keyed by entity.
    pub fn export_clocks(&self) -> BTreeMap<String, serde_json::Value> {
        self.clocks
            .iter()
            .map(|(entity, clock)| (entity.clone(), clock.to_json()))
            .collect()
    }

    /// Replace tracked clocks with previously exported ones.
    pub fn import_clocks(&mut self, clocks: BTreeMap<String, serde_json::Value>) -> Result<()> {
        for (entity, value) in clocks {
            let clock = VectorClock::from_json(value)?;
            self.clocks.insert(entity, clock);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.clocks.clear();
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
