//! Concord Persistence - Key-Value Store Abstraction
//!
//! The opaque key-value collaborator used to persist serialized CRDT state.
//! Callers treat the store as optional; the kernel runs fully in memory when
//! none is configured.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use async_trait::async_trait;
use concord_common::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Key-Value Store Trait
// =============================================================================

/// Pluggable key-value persistence interface.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the serialized state stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store serialized state under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

// =============================================================================
// Memory Store
// =============================================================================

/// Operation counters for a memory store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
}

/// In-process store backed by a hash map.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("missing").await.expect("get should succeed"), None);

        store
            .set("crdt:a", "{}".to_string())
            .await
            .expect("set should succeed");
        store
            .set("crdt:a", "{\"v\":1}".to_string())
            .await
            .expect("overwrite should succeed");

        let value = store.get("crdt:a").await.expect("get should succeed");
        assert_eq!(value.as_deref(), Some("{\"v\":1}"));
        assert_eq!(store.keys(), vec!["crdt:a".to_string()]);
        assert_eq!(store.stats(), StoreStats { reads: 2, writes: 2 });
    }
}
