//! Concord CRDT Registry
//!
//! Owns the CRDT instances of one replica, keyed by id. Remote states are
//! merged in by id, exported for dissemination, and persisted through an
//! optional key-value collaborator.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::crdt::{
    CrdtState, CrdtType, GCounter, LWWElementSet, LWWRegister, ORSet, PNCounter,
};
use crate::persistence::KeyValueStore;
use concord_common::config::CrdtConfig;
use concord_common::{NodeId, Result, SyncError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// CRDT Registry
// =============================================================================

/// Registry of CRDT instances owned by a single replica.
#[derive(Clone)]
pub struct CrdtRegistry {
    replica_id: NodeId,
    namespace: String,
    crdts: BTreeMap<String, CrdtState>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl CrdtRegistry {
    pub fn new(replica_id: impl Into<NodeId>) -> Self {
        Self::with_config(replica_id, &CrdtConfig::default())
    }

    pub fn with_config(replica_id: impl Into<NodeId>, config: &CrdtConfig) -> Self {
        Self {
            replica_id: replica_id.into(),
            namespace: config.namespace.clone(),
            crdts: BTreeMap::new(),
            store: None,
        }
    }

    /// Override the prefix of persisted keys.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Attach a persistence collaborator.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn replica_id(&self) -> &NodeId {
        &self.replica_id
    }

    // -------------------------------------------------------------------------
    // Creation and lookup
    // -------------------------------------------------------------------------

    /// Get-or-create. An existing instance is returned as is, whatever its type.
    pub fn create(&mut self, id: &str, crdt_type: CrdtType, seed: Option<Value>) -> &mut CrdtState {
        let replica_id = &self.replica_id;
        self.crdts.entry(id.to_string()).or_insert_with(|| {
            tracing::debug!(id, crdt_type = %crdt_type, "CRDT created");
            CrdtState::new(crdt_type, replica_id.clone(), seed)
        })
    }

    /// Get-or-create from a type name such as `"or_set"`.
    pub fn create_named(
        &mut self,
        id: &str,
        type_name: &str,
        seed: Option<Value>,
    ) -> Result<&mut CrdtState> {
        let crdt_type = CrdtType::from_str(type_name).map_err(|_| {
            SyncError::Configuration(format!("cannot create '{}': unknown CRDT type '{}'", id, type_name))
        })?;
        Ok(self.create(id, crdt_type, seed))
    }

    fn typed<T>(
        &mut self,
        id: &str,
        crdt_type: CrdtType,
        seed: Option<Value>,
        project: fn(&mut CrdtState) -> Option<&mut T>,
    ) -> Result<&mut T> {
        let state = self.create(id, crdt_type, seed);
        let found = state.crdt_type();
        project(state).ok_or_else(|| SyncError::CrdtTypeMismatch {
            id: id.to_string(),
            local: found.to_string(),
            remote: crdt_type.to_string(),
        })
    }

    pub fn g_counter(&mut self, id: &str) -> Result<&mut GCounter> {
        self.typed(id, CrdtType::GCounter, None, CrdtState::as_g_counter_mut)
    }

    pub fn pn_counter(&mut self, id: &str) -> Result<&mut PNCounter> {
        self.typed(id, CrdtType::PnCounter, None, CrdtState::as_pn_counter_mut)
    }

    pub fn lww_element_set(&mut self, id: &str) -> Result<&mut LWWElementSet> {
        self.typed(id, CrdtType::LwwElementSet, None, CrdtState::as_lww_element_set_mut)
    }

    pub fn or_set(&mut self, id: &str) -> Result<&mut ORSet> {
        self.typed(id, CrdtType::OrSet, None, CrdtState::as_or_set_mut)
    }

    pub fn lww_register(&mut self, id: &str, seed: Option<Value>) -> Result<&mut LWWRegister> {
        self.typed(id, CrdtType::LwwRegister, seed, CrdtState::as_lww_register_mut)
    }

    pub fn get(&self, id: &str) -> Option<&CrdtState> {
        self.crdts.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CrdtState> {
        self.crdts.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.crdts.contains_key(id)
    }

    /// Delete an instance. Only explicit application action removes CRDTs.
    pub fn remove(&mut self, id: &str) -> Option<CrdtState> {
        self.crdts.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.crdts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.crdts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crdts.is_empty()
    }

    // -------------------------------------------------------------------------
    // Merging and export
    // -------------------------------------------------------------------------

    /// Decode a remote serialized state and merge it into `id`.
    pub fn merge(&mut self, id: &str, remote: Value) -> Result<()> {
        let remote = CrdtState::from_json(remote)?;
        self.merge_state(id, remote)
    }

    /// Merge a decoded remote state, adopting it when `id` is unknown locally.
    pub fn merge_state(&mut self, id: &str, mut remote: CrdtState) -> Result<()> {
        match self.crdts.get_mut(id) {
            Some(local) => {
                if !local.merge(&remote) {
                    return Err(SyncError::CrdtTypeMismatch {
                        id: id.to_string(),
                        local: local.crdt_type().to_string(),
                        remote: remote.crdt_type().to_string(),
                    });
                }
                tracing::debug!(id, "CRDT merged");
            }
            None => {
                remote.reassign(self.replica_id.clone());
                tracing::debug!(id, crdt_type = %remote.crdt_type(), "CRDT adopted from remote state");
                self.crdts.insert(id.to_string(), remote);
            }
        }
        Ok(())
    }

    pub fn get_state(&self, id: &str) -> Result<Option<Value>> {
        self.crdts.get(id).map(CrdtState::to_json).transpose()
    }

    /// Owner-neutral state of `id`, the form carried over gossip.
    pub fn get_shared_state(&self, id: &str) -> Result<Option<Value>> {
        self.crdts.get(id).map(CrdtState::to_shared_json).transpose()
    }

    pub fn get_all_states(&self) -> Result<BTreeMap<String, Value>> {
        self.crdts
            .iter()
            .map(|(id, state)| Ok((id.clone(), state.to_json()?)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn storage_key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    /// Write `id` to the store. Returns false when there is no store or no
    /// such instance.
    pub async fn persist(&self, id: &str) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(state) = self.get_state(id)? else {
            return Ok(false);
        };

        store
            .set(&self.storage_key(id), serde_json::to_string(&state)?)
            .await?;
        tracing::debug!(id, "CRDT persisted");
        Ok(true)
    }

    /// Persist every instance, returning how many were written.
    pub async fn persist_all(&self) -> Result<usize> {
        let mut written = 0;
        for id in self.crdts.keys() {
            if self.persist(id).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Replace `id` with the stored state. Returns false when there is no
    /// store or nothing stored.
    pub async fn load(&mut self, id: &str) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(raw) = store.get(&self.storage_key(id)).await? else {
            return Ok(false);
        };

        let value: Value = serde_json::from_str(&raw)?;
        let mut state = CrdtState::from_json(value)?;
        state.reassign(self.replica_id.clone());
        self.crdts.insert(id.to_string(), state);
        tracing::debug!(id, "CRDT loaded");
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Crdt;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(SyncError::Persistence("store offline".to_string()))
        }

        async fn set(&self, _key: &str, _value: String) -> Result<()> {
            Err(SyncError::Persistence("store offline".to_string()))
        }
    }

    #[test]
    fn test_create_is_get_or_create() {
        let mut registry = CrdtRegistry::new("r1");
        registry.g_counter("hits").unwrap().increment(2);
        registry.create("hits", CrdtType::GCounter, None);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("hits").unwrap().value(), json!(2));
    }

    #[test]
    fn test_create_named_rejects_unknown_type() {
        let mut registry = CrdtRegistry::new("r1");
        let err = registry.create_named("x", "mv_register", None).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(registry.is_empty());

        registry.create_named("y", "pn_counter", None).unwrap();
        assert!(registry.contains("y"));
    }

    #[test]
    fn test_typed_access_checks_type() {
        let mut registry = CrdtRegistry::new("r1");
        registry.or_set("tags").unwrap();
        let err = registry.g_counter("tags").unwrap_err();
        assert!(matches!(err, SyncError::CrdtTypeMismatch { .. }));
    }

    #[test]
    fn test_merge_adopts_and_reowns_remote_state() {
        let mut remote = CrdtRegistry::new("r2");
        remote.g_counter("hits").unwrap().increment(5);
        let state = remote.get_state("hits").unwrap().unwrap();

        let mut local = CrdtRegistry::new("r1");
        local.merge("hits", state).unwrap();

        let counter = local.g_counter("hits").unwrap();
        assert_eq!(counter.replica_id(), &NodeId::new("r1"));
        counter.increment(3);
        assert_eq!(counter.value(), 8);
        assert_eq!(counter.replica_value(&NodeId::new("r2")), 5);
    }

    #[test]
    fn test_merge_errors_are_fatal() {
        let mut registry = CrdtRegistry::new("r1");
        registry.g_counter("hits").unwrap();

        let err = registry
            .merge("hits", json!({"type": "or_set", "replicaId": "r2", "elements": {}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::CrdtTypeMismatch { .. }));

        let err = registry
            .merge("other", json!({"type": "sequence", "replicaId": "r2"}))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownCrdtType(_)));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn test_get_all_states() {
        let mut registry = CrdtRegistry::new("r1");
        registry.pn_counter("balance").unwrap().decrement(4);
        registry.lww_register("mode", Some(json!("idle"))).unwrap();

        let states = registry.get_all_states().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states["balance"]["type"], "pn_counter");
        assert_eq!(states["mode"]["value"], "idle");
    }

    #[tokio::test]
    async fn test_persistence_is_optional() {
        let mut registry = CrdtRegistry::new("r1");
        registry.g_counter("hits").unwrap().increment(1);

        assert!(!registry.persist("hits").await.expect("persist without store"));
        assert!(!registry.load("hits").await.expect("load without store"));
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = CrdtRegistry::new("r1").with_store(store.clone());
        registry.or_set("tags").unwrap().add(&json!("rust"));
        registry.g_counter("hits").unwrap().increment(7);

        assert_eq!(registry.persist_all().await.expect("persist should succeed"), 2);
        assert!(!registry.persist("missing").await.expect("persist should succeed"));
        assert_eq!(store.keys(), vec!["crdt:hits".to_string(), "crdt:tags".to_string()]);

        let mut restored = CrdtRegistry::new("r1").with_store(store);
        assert!(restored.load("hits").await.expect("load should succeed"));
        assert!(restored.load("tags").await.expect("load should succeed"));
        assert!(!restored.load("missing").await.expect("load should succeed"));

        assert_eq!(restored.get("hits").unwrap().value(), json!(7));
        assert!(restored.or_set("tags").unwrap().contains(&json!("rust")));
    }

    #[tokio::test]
    async fn test_replicas_sharing_a_store_keep_separate_keys() {
        let store = Arc::new(MemoryStore::new());
        let mut r1 = CrdtRegistry::new("r1").with_namespace("crdt:r1").with_store(store.clone());
        let mut r2 = CrdtRegistry::new("r2").with_namespace("crdt:r2").with_store(store.clone());
        r1.g_counter("hits").unwrap().increment(1);
        r2.g_counter("hits").unwrap().increment(2);

        r1.persist_all().await.expect("persist should succeed");
        r2.persist_all().await.expect("persist should succeed");
        assert_eq!(store.keys(), vec!["crdt:r1:hits".to_string(), "crdt:r2:hits".to_string()]);

        let mut restored = CrdtRegistry::new("r1").with_namespace("crdt:r1").with_store(store);
        assert!(restored.load("hits").await.expect("load should succeed"));
        assert_eq!(restored.get("hits").unwrap().value(), json!(1));
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let mut registry = CrdtRegistry::new("r1").with_store(Arc::new(BrokenStore));
        registry.g_counter("hits").unwrap();

        let err = registry.persist("hits").await.unwrap_err();
        assert!(matches!(err, SyncError::Persistence(_)));
        assert!(registry.load("hits").await.is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_type() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("crdt:bad", "{\"type\":\"mystery\"}".to_string())
            .await
            .expect("set should succeed");

        let mut registry = CrdtRegistry::new("r1").with_store(store);
        let err = registry.load("bad").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownCrdtType(_)));
    }
}
