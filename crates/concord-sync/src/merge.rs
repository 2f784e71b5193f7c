//! Concord Gossip Merge Strategies
//!
//! How a gossip engine folds a remote key into its local state.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::registry::CrdtRegistry;
use concord_common::config::CrdtConfig;
use concord_common::Result;
use serde_json::Value;

// =============================================================================
// State Merge Trait
// =============================================================================

/// Per-key merge policy for gossiped state.
pub trait StateMerge: Send + 'static {
    /// Merge `remote` into `local` for `key`. Returns the value to store, or
    /// `None` when the local value stays as it is.
    fn merge_value(&mut self, key: &str, local: Option<&Value>, remote: &Value) -> Result<Option<Value>>;
}

// =============================================================================
// Last Write Wins
// =============================================================================

/// The remote value replaces the local one whenever they differ.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl StateMerge for LastWriteWins {
    fn merge_value(&mut self, _key: &str, local: Option<&Value>, remote: &Value) -> Result<Option<Value>> {
        if local == Some(remote) {
            Ok(None)
        } else {
            Ok(Some(remote.clone()))
        }
    }
}

// =============================================================================
// CRDT Merge
// =============================================================================

/// Routes keys under a prefix through a CRDT registry; everything else is
/// last-write-wins.
///
/// A key `crdt:likes` carries the serialized CRDT `likes`. Remote values are
/// merged into the registry and the merged serialization becomes the local
/// value, so the next gossip round spreads the join rather than either side.
pub struct CrdtMerge {
    registry: CrdtRegistry,
    prefix: String,
}

impl CrdtMerge {
    pub fn new(registry: CrdtRegistry) -> Self {
        Self::with_config(registry, &CrdtConfig::default())
    }

    pub fn with_config(registry: CrdtRegistry, config: &CrdtConfig) -> Self {
        Self {
            registry,
            prefix: config.gossip_prefix.clone(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry(&self) -> &CrdtRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CrdtRegistry {
        &mut self.registry
    }

    /// Gossip key under which CRDT `id` travels.
    pub fn state_key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }
}

impl StateMerge for CrdtMerge {
    fn merge_value(&mut self, key: &str, local: Option<&Value>, remote: &Value) -> Result<Option<Value>> {
        let Some(id) = key.strip_prefix(self.prefix.as_str()) else {
            return LastWriteWins.merge_value(key, local, remote);
        };

        self.registry.merge(id, remote.clone())?;
        let merged = self.registry.get_shared_state(id)?;
        Ok(merged.filter(|merged| Some(merged) != local))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{CrdtState, CrdtType};
    use concord_common::{NodeId, SyncError};
    use serde_json::json;

    #[test]
    fn test_last_write_wins() {
        let mut lww = LastWriteWins;
        assert_eq!(lww.merge_value("k", None, &json!(1)).unwrap(), Some(json!(1)));
        assert_eq!(lww.merge_value("k", Some(&json!(1)), &json!(1)).unwrap(), None);
        assert_eq!(
            lww.merge_value("k", Some(&json!(1)), &json!(2)).unwrap(),
            Some(json!(2))
        );
    }

    #[test]
    fn test_crdt_keys_are_joined() {
        let mut local = CrdtRegistry::new("r1");
        local.g_counter("hits").unwrap().increment(3);
        let local_json = local.get_state("hits").unwrap().unwrap();

        let mut remote = CrdtRegistry::new("r2");
        remote.g_counter("hits").unwrap().increment(5);
        let remote_json = remote.get_state("hits").unwrap().unwrap();

        let mut merge = CrdtMerge::new(local);
        let merged = merge
            .merge_value("crdt:hits", Some(&local_json), &remote_json)
            .unwrap()
            .unwrap();

        assert_eq!(CrdtState::from_json(merged).unwrap().value(), json!(8));
        assert_eq!(merge.registry().get("hits").unwrap().crdt_type(), CrdtType::GCounter);

        // Merging the same remote again changes nothing.
        let current = merge.registry().get_shared_state("hits").unwrap().unwrap();
        assert_eq!(merge.merge_value("crdt:hits", Some(&current), &remote_json).unwrap(), None);
        assert_eq!(current["replicaId"], "");
    }

    #[test]
    fn test_replicas_gossip_identical_crdt_values() {
        let mut r1 = CrdtMerge::new(CrdtRegistry::new("r1"));
        let mut r2 = CrdtMerge::new(CrdtRegistry::new("r2"));
        r1.registry_mut().g_counter("hits").unwrap().increment(2);
        r2.registry_mut().g_counter("hits").unwrap().increment(7);
        let from_r1 = r1.registry().get_shared_state("hits").unwrap().unwrap();
        let from_r2 = r2.registry().get_shared_state("hits").unwrap().unwrap();

        let at_r1 = r1.merge_value("crdt:hits", Some(&from_r1), &from_r2).unwrap().unwrap();
        let at_r2 = r2.merge_value("crdt:hits", Some(&from_r2), &from_r1).unwrap().unwrap();
        assert_eq!(at_r1, at_r2);

        // Each side now holds the other's value, so the next exchange is quiet.
        assert_eq!(r1.merge_value("crdt:hits", Some(&at_r1), &at_r2).unwrap(), None);
        assert_eq!(r2.registry().get("hits").unwrap().replica_id(), &NodeId::new("r2"));
    }

    #[test]
    fn test_plain_keys_fall_back_to_last_write_wins() {
        let mut merge = CrdtMerge::new(CrdtRegistry::new("r1"));
        assert_eq!(
            merge.merge_value("config", Some(&json!("a")), &json!("b")).unwrap(),
            Some(json!("b"))
        );
        assert!(merge.registry().is_empty());
        assert_eq!(merge.state_key("likes"), "crdt:likes");
    }

    #[test]
    fn test_unknown_crdt_type_is_fatal() {
        let mut merge = CrdtMerge::new(CrdtRegistry::new("r1"));
        let err = merge
            .merge_value("crdt:x", None, &json!({"type": "mystery"}))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownCrdtType(_)));
        assert!(err.is_fatal());
    }
}
