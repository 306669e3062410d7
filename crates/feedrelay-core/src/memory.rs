//! In-process implementations of the storage ports.
//!
//! Both stores keep everything in memory, so delivery is at-least-once
//! across restarts: a restarted process may redeliver items it had already
//! sent.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::CallError,
    models::{CircuitSnapshot, ItemId, Scope},
    ports::{CircuitStateStore, SeenStore},
};

/// Seen-set keyed by `(item, scope)`.
#[derive(Debug, Default)]
pub struct MemorySeenStore {
    seen: RwLock<HashSet<(ItemId, Scope)>>,
}

impl MemorySeenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded `(item, scope)` pairs.
    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }

    /// True when nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.is_empty()
    }
}

#[async_trait]
impl SeenStore for MemorySeenStore {
    async fn has_seen(&self, item: &ItemId, scope: &Scope) -> Result<bool, CallError> {
        Ok(self.seen.read().await.contains(&(item.clone(), scope.clone())))
    }

    async fn mark_seen(&self, item: &ItemId, scope: &Scope) -> Result<(), CallError> {
        self.seen.write().await.insert((item.clone(), scope.clone()));
        Ok(())
    }
}

/// Circuit snapshots keyed by category.
#[derive(Debug, Default)]
pub struct MemoryCircuitStore {
    snapshots: RwLock<HashMap<String, CircuitSnapshot>>,
}

impl MemoryCircuitStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CircuitStateStore for MemoryCircuitStore {
    async fn save(&self, category: &str, snapshot: &CircuitSnapshot) -> Result<(), CallError> {
        self.snapshots.write().await.insert(category.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, category: &str) -> Result<Option<CircuitSnapshot>, CallError> {
        Ok(self.snapshots.read().await.get(category).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CircuitState;

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let store = MemorySeenStore::new();
        let item = ItemId::new("42");
        let scope = Scope::new("rust");

        assert!(!store.has_seen(&item, &scope).await.unwrap());

        store.mark_seen(&item, &scope).await.unwrap();
        store.mark_seen(&item, &scope).await.unwrap();

        assert!(store.has_seen(&item, &scope).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn seen_is_partitioned_by_scope() {
        let store = MemorySeenStore::new();
        let item = ItemId::new("42");

        store.mark_seen(&item, &Scope::new("rust")).await.unwrap();

        assert!(!store.has_seen(&item, &Scope::new("go")).await.unwrap());
    }

    #[tokio::test]
    async fn circuit_store_round_trip() {
        let store = MemoryCircuitStore::new();
        let snapshot = CircuitSnapshot {
            category: "upstream-fetch".to_string(),
            state: CircuitState::Open,
            failure_count: 5,
            last_failure_at: Some(chrono::Utc::now()),
            last_test_at: None,
        };

        assert!(store.load("upstream-fetch").await.unwrap().is_none());

        store.save("upstream-fetch", &snapshot).await.unwrap();

        assert_eq!(store.load("upstream-fetch").await.unwrap(), Some(snapshot));
    }
}
