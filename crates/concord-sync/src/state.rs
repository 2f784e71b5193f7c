//! Concord Replicated State Machine
//!
//! The apply hook Raft drives with committed entries, plus snapshot types.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::log::{LogIndex, Term};
use concord_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// =============================================================================
// State Machine Trait
// =============================================================================

/// Application state driven by committed log entries.
///
/// `apply` is called exactly once per committed entry, in index order.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &str, data: &Value) -> Result<()>;

    /// Serialize the full state for a snapshot.
    fn snapshot(&self) -> Result<Value>;

    /// Replace the full state with a snapshot produced by `snapshot`.
    fn restore(&mut self, state: Value) -> Result<()>;
}

// =============================================================================
// Key-Value State Machine
// =============================================================================

/// Default state machine: every command stores its data under the command
/// name.
#[derive(Debug, Clone, Default)]
pub struct KeyValueStateMachine {
    data: BTreeMap<String, Value>,
    version: u64,
}

impl KeyValueStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of applied writes since creation or the last restore.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl StateMachine for KeyValueStateMachine {
    fn apply(&mut self, command: &str, data: &Value) -> Result<()> {
        self.data.insert(command.to_string(), data.clone());
        self.version += 1;
        Ok(())
    }

    fn snapshot(&self) -> Result<Value> {
        let map: Map<String, Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Value::Object(map))
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        match state {
            Value::Object(map) => {
                self.data = map.into_iter().collect();
                self.version = 0;
                Ok(())
            }
            other => Err(SyncError::StateMachine(format!(
                "snapshot must be a JSON object, got {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Position a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}

/// A state-machine snapshot replacing the log prefix it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub state: Value,
}

impl Snapshot {
    pub fn new(last_included_index: LogIndex, last_included_term: Term, state: Value) -> Self {
        Self {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
            },
            state,
        }
    }

    pub fn last_included_index(&self) -> LogIndex {
        self.metadata.last_included_index
    }

    pub fn last_included_term(&self) -> Term {
        self.metadata.last_included_term
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
    fn test_apply_stores_data_under_command() {
        let mut sm = KeyValueStateMachine::new();
        sm.apply("user:1", &json!({"name": "ada"})).unwrap();
        sm.apply("user:1", &json!({"name": "grace"})).unwrap();

        assert_eq!(sm.get("user:1"), Some(&json!({"name": "grace"})));
        assert_eq!(sm.len(), 1);
        assert_eq!(sm.version(), 2);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut sm = KeyValueStateMachine::new();
        sm.apply("a", &json!(1)).unwrap();
        sm.apply("b", &json!([2])).unwrap();
        let snapshot = sm.snapshot().unwrap();

        let mut restored = KeyValueStateMachine::new();
        restored.restore(snapshot).unwrap();
        assert_eq!(restored.get("b"), Some(&json!([2])));
        assert_eq!(restored.len(), 2);

        assert!(matches!(
            restored.restore(json!([1, 2])),
            Err(SyncError::StateMachine(_))
        ));
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = Snapshot::new(10, 3, json!({"k": "v"}));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["metadata"]["lastIncludedIndex"], 10);
        assert_eq!(json["metadata"]["lastIncludedTerm"], 3);

        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
