//! Concord CRDTs (Conflict-free Replicated Data Types)
//!
//! State-based replicated types that converge under any merge order. Every
//! type is owned by one replica, mutated only through that replica's slot,
//! and serialized with a mandatory `type` tag that drives decoding.
//!
//! Set elements are arbitrary JSON values, keyed internally by their compact
//! JSON text.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use concord_common::utils::now_millis;
use concord_common::{NodeId, Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// CRDT Trait
// =============================================================================

/// Trait for conflict-free replicated data types.
pub trait Crdt: Clone {
    /// Replica that owns this copy.
    fn replica_id(&self) -> &NodeId;

    /// Merge another replica's state into this one.
    fn merge(&mut self, other: &Self);

    /// Create a merged instance without modifying self.
    fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

fn element_key(element: &Value) -> String {
    element.to_string()
}

fn element_from_key(key: &str) -> Value {
    serde_json::from_str(key).unwrap_or_else(|_| Value::String(key.to_string()))
}

// =============================================================================
// CRDT Type Tags
// =============================================================================

/// Wire tag of each CRDT type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtType {
    GCounter,
    PnCounter,
    LwwElementSet,
    OrSet,
    LwwRegister,
}

impl CrdtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtType::GCounter => "g_counter",
            CrdtType::PnCounter => "pn_counter",
            CrdtType::LwwElementSet => "lww_element_set",
            CrdtType::OrSet => "or_set",
            CrdtType::LwwRegister => "lww_register",
        }
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrdtType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "g_counter" => Ok(CrdtType::GCounter),
            "pn_counter" => Ok(CrdtType::PnCounter),
            "lww_element_set" => Ok(CrdtType::LwwElementSet),
            "or_set" => Ok(CrdtType::OrSet),
            "lww_register" => Ok(CrdtType::LwwRegister),
            other => Err(SyncError::UnknownCrdtType(other.to_string())),
        }
    }
}

// =============================================================================
// G-Counter (Grow-only Counter)
// =============================================================================

/// A grow-only counter with one slot per replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GCounter {
    replica_id: NodeId,
    counters: BTreeMap<NodeId, u64>,
}

impl GCounter {
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            counters: BTreeMap::new(),
        }
    }

    /// Add `amount` to this replica's slot.
    pub fn increment(&mut self, amount: u64) {
        let slot = self.counters.entry(self.replica_id.clone()).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    /// Sum of every slot, saturating at `u64::MAX`.
    pub fn value(&self) -> u64 {
        self.counters.values().fold(0u64, |total, &count| total.saturating_add(count))
    }

    /// Count contributed by one replica.
    pub fn replica_value(&self, replica: &NodeId) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<NodeId, u64> {
        &self.counters
    }

    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        self.replica_id = replica_id;
    }
}

impl Crdt for GCounter {
    fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    fn merge(&mut self, other: &Self) {
        for (replica, &count) in &other.counters {
            let current = self.counters.entry(replica.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }
}

// =============================================================================
// PN-Counter (Positive-Negative Counter)
// =============================================================================

/// A counter supporting increments and decrements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PNCounter {
    replica_id: NodeId,
    positive: GCounter,
    negative: GCounter,
}

impl PNCounter {
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        let replica_id = replica_id.into();
        Self {
            positive: GCounter::new(replica_id.clone()),
            negative: GCounter::new(replica_id.clone()),
            replica_id,
        }
    }

    pub fn increment(&mut self, amount: u64) {
        self.positive.increment(amount);
    }

    pub fn decrement(&mut self, amount: u64) {
        self.negative.increment(amount);
    }

    /// Increments minus decrements, clamped to the `i64` range.
    pub fn value(&self) -> i64 {
        let net = i128::from(self.positive.value()) - i128::from(self.negative.value());
        net.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    pub fn positive(&self) -> &GCounter {
        &self.positive
    }

    pub fn negative(&self) -> &GCounter {
        &self.negative
    }

    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        self.positive.reassign(replica_id.clone());
        self.negative.reassign(replica_id.clone());
        self.replica_id = replica_id;
    }
}

impl Crdt for PNCounter {
    fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    fn merge(&mut self, other: &Self) {
        self.positive.merge(&other.positive);
        self.negative.merge(&other.negative);
    }
}

// =============================================================================
// LWW-Element-Set (Last-Writer-Wins Element Set)
// =============================================================================

/// A set whose membership is decided by the newest add or remove timestamp.
///
/// An element is present iff its add timestamp is strictly greater than its
/// remove timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LWWElementSet {
    replica_id: NodeId,
    add_set: BTreeMap<String, u64>,
    remove_set: BTreeMap<String, u64>,
}

impl LWWElementSet {
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            add_set: BTreeMap::new(),
            remove_set: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, element: &Value) {
        self.add_at(element, now_millis());
    }

    pub fn add_at(&mut self, element: &Value, timestamp: u64) {
        Self::record(&mut self.add_set, element_key(element), timestamp);
    }

    pub fn remove(&mut self, element: &Value) {
        self.remove_at(element, now_millis());
    }

    pub fn remove_at(&mut self, element: &Value, timestamp: u64) {
        Self::record(&mut self.remove_set, element_key(element), timestamp);
    }

    fn record(map: &mut BTreeMap<String, u64>, key: String, timestamp: u64) {
        let current = map.entry(key).or_insert(timestamp);
        *current = (*current).max(timestamp);
    }

    pub fn contains(&self, element: &Value) -> bool {
        self.contains_key(&element_key(element))
    }

    fn contains_key(&self, key: &str) -> bool {
        match self.add_set.get(key) {
            Some(&added) => added > self.remove_set.get(key).copied().unwrap_or(0),
            None => false,
        }
    }

    pub fn values(&self) -> Vec<Value> {
        self.add_set
            .keys()
            .filter(|key| self.contains_key(key))
            .map(|key| element_from_key(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.add_set.keys().filter(|key| self.contains_key(key)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_set(&self) -> &BTreeMap<String, u64> {
        &self.add_set
    }

    pub fn remove_set(&self) -> &BTreeMap<String, u64> {
        &self.remove_set
    }

    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        self.replica_id = replica_id;
    }
}

impl Crdt for LWWElementSet {
    fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    fn merge(&mut self, other: &Self) {
        for (key, &ts) in &other.add_set {
            Self::record(&mut self.add_set, key.clone(), ts);
        }
        for (key, &ts) in &other.remove_set {
            Self::record(&mut self.remove_set, key.clone(), ts);
        }
    }
}

// =============================================================================
// OR-Set (Observed-Remove Set)
// =============================================================================

/// A set in which every add creates a fresh tag and an element is present
/// while it holds at least one tag.
///
/// `remove` clears every tag of the element, not only those this replica has
/// observed. The removal is recorded as a watermark timestamp so that tags
/// minted before it are also dropped when they arrive through a later merge.
/// Adds made after the watermark make the element visible again.
///
/// Watermarks compare wall-clock millis across replicas. A remove stamped
/// earlier than a concurrent add it has not seen leaves the element present
/// after merge, so removal of unseen adds holds only while replica clocks
/// order the remove at or after the add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ORSet {
    replica_id: NodeId,
    elements: BTreeMap<String, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tombstones: BTreeMap<String, u64>,
}

impl ORSet {
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            elements: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Add an element, returning the tag minted for this addition.
    pub fn add(&mut self, element: &Value) -> String {
        self.add_at(element, now_millis())
    }

    pub fn add_at(&mut self, element: &Value, timestamp: u64) -> String {
        let key = element_key(element);
        // An add issued after a local remove must outlive that remove.
        let timestamp = match self.tombstones.get(&key) {
            Some(&watermark) if timestamp <= watermark => watermark + 1,
            _ => timestamp,
        };
        let tag = format!(
            "{}:{}:{}",
            self.replica_id,
            timestamp,
            Uuid::new_v4().simple()
        );
        self.elements.entry(key).or_default().insert(tag.clone());
        tag
    }

    pub fn remove(&mut self, element: &Value) {
        self.remove_at(element, now_millis());
    }

    pub fn remove_at(&mut self, element: &Value, timestamp: u64) {
        let key = element_key(element);
        let newest_tag = self
            .elements
            .remove(&key)
            .map(|tags| tags.iter().map(|t| tag_timestamp(t)).max().unwrap_or(0))
            .unwrap_or(0);
        let watermark = self.tombstones.entry(key).or_insert(0);
        *watermark = (*watermark).max(timestamp).max(newest_tag);
    }

    pub fn contains(&self, element: &Value) -> bool {
        self.elements
            .get(&element_key(element))
            .map(|tags| !tags.is_empty())
            .unwrap_or(false)
    }

    pub fn values(&self) -> Vec<Value> {
        self.elements
            .iter()
            .filter(|(_, tags)| !tags.is_empty())
            .map(|(key, _)| element_from_key(key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.elements.values().filter(|tags| !tags.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tags currently held for an element.
    pub fn tags(&self, element: &Value) -> Option<&BTreeSet<String>> {
        self.elements.get(&element_key(element))
    }

    pub fn tombstones(&self) -> &BTreeMap<String, u64> {
        &self.tombstones
    }

    fn prune(&mut self) {
        for (key, &watermark) in &self.tombstones {
            if let Some(tags) = self.elements.get_mut(key) {
                tags.retain(|tag| tag_timestamp(tag) > watermark);
            }
        }
        self.elements.retain(|_, tags| !tags.is_empty());
    }

    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        self.replica_id = replica_id;
    }
}

/// Timestamp embedded in a `<replica>:<millis>:<nonce>` tag.
fn tag_timestamp(tag: &str) -> u64 {
    tag.rsplitn(3, ':')
        .nth(1)
        .and_then(|ts| ts.parse().ok())
        .unwrap_or(0)
}

impl Crdt for ORSet {
    fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    fn merge(&mut self, other: &Self) {
        for (key, tags) in &other.elements {
            self.elements
                .entry(key.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
        for (key, &watermark) in &other.tombstones {
            let current = self.tombstones.entry(key.clone()).or_insert(0);
            *current = (*current).max(watermark);
        }
        self.prune();
    }
}

// =============================================================================
// LWW-Register (Last-Writer-Wins Register)
// =============================================================================

/// A single value resolved by timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LWWRegister {
    replica_id: NodeId,
    value: Value,
    timestamp: u64,
}

impl LWWRegister {
    pub fn new(replica_id: impl Into<NodeId>, initial: Value) -> Self {
        Self {
            replica_id: replica_id.into(),
            value: initial,
            timestamp: 0,
        }
    }

    pub fn set(&mut self, value: Value) -> bool {
        self.set_at(value, now_millis())
    }

    /// Write `value` if `timestamp` is strictly newer than the current one.
    pub fn set_at(&mut self, value: Value, timestamp: u64) -> bool {
        if timestamp > self.timestamp {
            self.value = value;
            self.timestamp = timestamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> &Value {
        &self.value
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        self.replica_id = replica_id;
    }
}

impl Crdt for LWWRegister {
    fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    fn merge(&mut self, other: &Self) {
        // Equal timestamps fall back to the larger JSON text so every replica
        // settles on the same value.
        let newer = other.timestamp > self.timestamp
            || (other.timestamp == self.timestamp
                && element_key(&other.value) > element_key(&self.value));
        if newer {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
        }
    }
}

// =============================================================================
// Tagged CRDT State
// =============================================================================

/// Any CRDT, tagged with its wire type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CrdtState {
    #[serde(rename = "g_counter")]
    GCounter(GCounter),
    #[serde(rename = "pn_counter")]
    PNCounter(PNCounter),
    #[serde(rename = "lww_element_set")]
    LWWElementSet(LWWElementSet),
    #[serde(rename = "or_set")]
    ORSet(ORSet),
    #[serde(rename = "lww_register")]
    LWWRegister(LWWRegister),
}

impl CrdtState {
    /// Create an empty instance. `seed` is the initial register value and is
    /// ignored by the other types.
    pub fn new(crdt_type: CrdtType, replica_id: impl Into<NodeId>, seed: Option<Value>) -> Self {
        let replica_id = replica_id.into();
        match crdt_type {
            CrdtType::GCounter => CrdtState::GCounter(GCounter::new(replica_id)),
            CrdtType::PnCounter => CrdtState::PNCounter(PNCounter::new(replica_id)),
            CrdtType::LwwElementSet => CrdtState::LWWElementSet(LWWElementSet::new(replica_id)),
            CrdtType::OrSet => CrdtState::ORSet(ORSet::new(replica_id)),
            CrdtType::LwwRegister => {
                CrdtState::LWWRegister(LWWRegister::new(replica_id, seed.unwrap_or(Value::Null)))
            }
        }
    }

    pub fn crdt_type(&self) -> CrdtType {
        match self {
            CrdtState::GCounter(_) => CrdtType::GCounter,
            CrdtState::PNCounter(_) => CrdtType::PnCounter,
            CrdtState::LWWElementSet(_) => CrdtType::LwwElementSet,
            CrdtState::ORSet(_) => CrdtType::OrSet,
            CrdtState::LWWRegister(_) => CrdtType::LwwRegister,
        }
    }

    pub fn replica_id(&self) -> &NodeId {
        match self {
            CrdtState::GCounter(c) => c.replica_id(),
            CrdtState::PNCounter(c) => c.replica_id(),
            CrdtState::LWWElementSet(s) => s.replica_id(),
            CrdtState::ORSet(s) => s.replica_id(),
            CrdtState::LWWRegister(r) => r.replica_id(),
        }
    }

    /// Merge a state of the same type. Returns false, leaving self untouched,
    /// when the types differ.
    pub fn merge(&mut self, other: &CrdtState) -> bool {
        match (self, other) {
            (CrdtState::GCounter(a), CrdtState::GCounter(b)) => a.merge(b),
            (CrdtState::PNCounter(a), CrdtState::PNCounter(b)) => a.merge(b),
            (CrdtState::LWWElementSet(a), CrdtState::LWWElementSet(b)) => a.merge(b),
            (CrdtState::ORSet(a), CrdtState::ORSet(b)) => a.merge(b),
            (CrdtState::LWWRegister(a), CrdtState::LWWRegister(b)) => a.merge(b),
            _ => return false,
        }
        true
    }

    /// Hand ownership of this copy to `replica_id`.
    pub(crate) fn reassign(&mut self, replica_id: NodeId) {
        match self {
            CrdtState::GCounter(c) => c.reassign(replica_id),
            CrdtState::PNCounter(c) => c.reassign(replica_id),
            CrdtState::LWWElementSet(s) => s.reassign(replica_id),
            CrdtState::ORSet(s) => s.reassign(replica_id),
            CrdtState::LWWRegister(r) => r.reassign(replica_id),
        }
    }

    /// Observable value: a number for counters, an array for sets, the stored
    /// value for registers.
    pub fn value(&self) -> Value {
        match self {
            CrdtState::GCounter(c) => Value::from(c.value()),
            CrdtState::PNCounter(c) => Value::from(c.value()),
            CrdtState::LWWElementSet(s) => Value::Array(s.values()),
            CrdtState::ORSet(s) => Value::Array(s.values()),
            CrdtState::LWWRegister(r) => r.get().clone(),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Replication form: the owner is blanked so every replica holding the
    /// same data encodes it identically. Adoption reassigns the owner.
    pub fn to_shared_json(&self) -> Result<Value> {
        let mut shared = self.clone();
        shared.reassign(NodeId::new(""));
        shared.to_json()
    }

    /// Decode a tagged state. A missing or unknown `type` tag is an error.
    pub fn from_json(value: Value) -> Result<Self> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Decode("CRDT state has no type tag".to_string()))?;
        CrdtType::from_str(tag)?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn as_g_counter_mut(&mut self) -> Option<&mut GCounter> {
        match self {
            CrdtState::GCounter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_pn_counter_mut(&mut self) -> Option<&mut PNCounter> {
        match self {
            CrdtState::PNCounter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_lww_element_set_mut(&mut self) -> Option<&mut LWWElementSet> {
        match self {
            CrdtState::LWWElementSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_or_set_mut(&mut self) -> Option<&mut ORSet> {
        match self {
            CrdtState::ORSet(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_lww_register_mut(&mut self) -> Option<&mut LWWRegister> {
        match self {
            CrdtState::LWWRegister(r) => Some(r),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gcounter() {
        let mut a = GCounter::new("r1");
        let mut b = GCounter::new("r2");

        a.increment(3);
        b.increment(5);
        a.merge(&b);

        assert_eq!(a.value(), 8);
        assert_eq!(a.replica_value(&NodeId::new("r2")), 5);

        // Merging stale state never lowers a slot.
        let stale = GCounter::new("r2");
        a.merge(&stale);
        assert_eq!(a.value(), 8);
    }

    #[test]
    fn test_pncounter() {
        let mut a = PNCounter::new("r1");
        let mut b = PNCounter::new("r2");

        a.increment(10);
        a.decrement(3);
        b.decrement(9);
        a.merge(&b);

        assert_eq!(a.value(), -2);
    }

    #[test]
    fn test_lww_element_set() {
        let mut set = LWWElementSet::new("r1");
        set.add_at(&json!("x"), 10);
        assert!(set.contains(&json!("x")));

        set.remove_at(&json!("x"), 10);
        assert!(!set.contains(&json!("x")), "equal timestamps favour removal");

        set.add_at(&json!("x"), 11);
        set.add_at(&json!({"k": 1}), 5);
        assert!(set.contains(&json!("x")));
        assert_eq!(set.len(), 2);
        assert!(set.values().contains(&json!({"k": 1})));
    }

    #[test]
    fn test_orset_add_remove_readd() {
        let mut set = ORSet::new("r1");
        let tag = set.add_at(&json!("x"), 100);
        assert!(tag.starts_with("r1:100:"));
        assert!(set.contains(&json!("x")));

        set.remove_at(&json!("x"), 50);
        assert!(!set.contains(&json!("x")));

        // A later add at an older wall-clock time still wins locally.
        set.add_at(&json!("x"), 90);
        assert!(set.contains(&json!("x")));
    }

    #[test]
    fn test_orset_merge_unions_tags() {
        let mut a = ORSet::new("r1");
        let mut b = ORSet::new("r2");
        a.add_at(&json!(1), 10);
        b.add_at(&json!(1), 20);
        b.add_at(&json!(2), 20);

        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.tags(&json!(1)).map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_orset_remove_clears_unobserved_tags() {
        let mut r1 = ORSet::new("r1");
        let mut r2 = ORSet::new("r2");

        r1.add_at(&json!("x"), 100);
        r2.remove_at(&json!("x"), 200);

        let left = r1.merged(&r2);
        let right = r2.merged(&r1);
        assert!(!left.contains(&json!("x")));
        assert!(!right.contains(&json!("x")));
    }

    #[test]
    fn test_orset_remove_stamped_before_unseen_add_keeps_element() {
        let mut r1 = ORSet::new("r1");
        let mut r2 = ORSet::new("r2");

        r1.add_at(&json!("x"), 200);
        r2.remove_at(&json!("x"), 150);

        let left = r1.merged(&r2);
        let right = r2.merged(&r1);
        assert!(left.contains(&json!("x")));
        assert!(right.contains(&json!("x")));
        assert_eq!(left.tombstones()["\"x\""], 150);
    }

    #[test]
    fn test_gcounter_value_saturates() {
        let mut a = GCounter::new("r1");
        let mut b = GCounter::new("r2");
        a.increment(u64::MAX - 1);
        b.increment(10);
        a.merge(&b);

        assert_eq!(a.value(), u64::MAX);
        assert_eq!(a.replica_value(&NodeId::new("r1")), u64::MAX - 1);
    }

    #[test]
    fn test_pncounter_value_clamps_to_i64() {
        let mut up = PNCounter::new("r1");
        up.increment(u64::MAX);
        assert_eq!(up.value(), i64::MAX);

        let mut down = PNCounter::new("r2");
        down.decrement(u64::MAX);
        assert_eq!(down.value(), i64::MIN);

        up.merge(&down);
        assert_eq!(up.value(), 0);

        let mut exact = PNCounter::new("r3");
        exact.increment(i64::MAX as u64 + 5);
        exact.decrement(10);
        assert_eq!(exact.value(), i64::MAX - 5);
    }

    #[test]
    fn test_lww_register() {
        let mut reg = LWWRegister::new("r1", Value::Null);
        assert!(reg.set_at(json!("a"), 10));
        assert!(!reg.set_at(json!("b"), 10));
        assert!(!reg.set_at(json!("c"), 5));
        assert_eq!(reg.get(), &json!("a"));

        let mut other = LWWRegister::new("r2", Value::Null);
        other.set_at(json!("z"), 20);
        reg.merge(&other);
        assert_eq!(reg.get(), &json!("z"));
        assert_eq!(reg.timestamp(), 20);
    }

    #[test]
    fn test_lww_register_tie_is_symmetric() {
        let mut a = LWWRegister::new("r1", Value::Null);
        let mut b = LWWRegister::new("r2", Value::Null);
        a.set_at(json!("apple"), 7);
        b.set_at(json!("pear"), 7);

        assert_eq!(a.merged(&b).get(), b.merged(&a).get());
    }

    #[test]
    fn test_state_json_round_trip() {
        let mut counter = GCounter::new("r1");
        counter.increment(4);
        let state = CrdtState::GCounter(counter);

        let json = state.to_json().unwrap();
        assert_eq!(json["type"], "g_counter");
        assert_eq!(json["replicaId"], "r1");
        assert_eq!(json["counters"]["r1"], 4);

        let back = CrdtState::from_json(json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.value(), json!(4));
    }

    #[test]
    fn test_state_decode_errors() {
        let err = CrdtState::from_json(json!({"type": "mv_register", "replicaId": "r1"})).unwrap_err();
        assert!(matches!(err, SyncError::UnknownCrdtType(t) if t == "mv_register"));

        let err = CrdtState::from_json(json!({"replicaId": "r1"})).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));

        let err = CrdtState::from_json(json!({"type": "g_counter", "counters": 3})).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[test]
    fn test_state_merge_rejects_other_types() {
        let mut counter = CrdtState::new(CrdtType::GCounter, "r1", None);
        let set = CrdtState::new(CrdtType::OrSet, "r1", None);
        assert!(!counter.merge(&set));
        assert_eq!(counter.crdt_type(), CrdtType::GCounter);
    }

    #[test]
    fn test_type_tags() {
        for t in [
            CrdtType::GCounter,
            CrdtType::PnCounter,
            CrdtType::LwwElementSet,
            CrdtType::OrSet,
            CrdtType::LwwRegister,
        ] {
            assert_eq!(t.as_str().parse::<CrdtType>().unwrap(), t);
            let state = CrdtState::new(t, "r1", None);
            assert_eq!(state.to_json().unwrap()["type"], t.as_str());
        }
        assert!("bogus".parse::<CrdtType>().is_err());
    }

    #[test]
    fn test_register_seed() {
        let state = CrdtState::new(CrdtType::LwwRegister, "r1", Some(json!({"mode": "on"})));
        assert_eq!(state.value(), json!({"mode": "on"}));
    }
}
