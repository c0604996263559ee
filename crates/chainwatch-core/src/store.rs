//! Key/value persistence used for task status, accounts and the event log.
//!
//! Values are JSON documents grouped into named stores. Implementations
//! include [`MemoryStore`] here and the SQLite backend in
//! `chainwatch-storage`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::WatchError;

/// Store holding account-scoped task records.
pub const ACCOUNT_TASKS: &str = "account_subscriptions";
/// Store holding chain-scoped task records.
pub const CHAIN_TASKS: &str = "chain_subscriptions";
/// Store holding account records.
pub const ACCOUNTS: &str = "accounts";
/// Store holding the dispatched event log.
pub const EVENTS: &str = "events";

/// Trait for the persistent key/value collaborator.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, WatchError>;

    /// Upsert a value.
    async fn set(&self, store: &str, key: &str, value: Value) -> Result<(), WatchError>;

    async fn delete(&self, store: &str, key: &str) -> Result<(), WatchError>;

    /// All values in a store, ordered by key.
    async fn get_all(&self, store: &str) -> Result<Vec<Value>, WatchError>;

    /// All key → value pairs in a store.
    async fn get_all_objects(&self, store: &str) -> Result<BTreeMap<String, Value>, WatchError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in `store`.
    pub fn len(&self, store: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .get(store)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, store: &str) -> bool {
        self.len(store) == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, WatchError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(store)
            .and_then(|s| s.get(key))
            .cloned())
    }

    async fn set(&self, store: &str, key: &str, value: Value) -> Result<(), WatchError> {
        self.data
            .lock()
            .unwrap()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), WatchError> {
        if let Some(s) = self.data.lock().unwrap().get_mut(store) {
            s.remove(key);
        }
        Ok(())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, WatchError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(store)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_all_objects(&self, store: &str) -> Result<BTreeMap<String, Value>, WatchError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(store)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get(CHAIN_TASKS, "a").await.unwrap().is_none());

        store.set(CHAIN_TASKS, "b", json!({"n": 2})).await.unwrap();
        store.set(CHAIN_TASKS, "a", json!({"n": 1})).await.unwrap();
        store.set(ACCOUNTS, "a", json!("other store")).await.unwrap();

        assert_eq!(store.get(CHAIN_TASKS, "a").await.unwrap(), Some(json!({"n": 1})));
        let all = store.get_all(CHAIN_TASKS).await.unwrap();
        assert_eq!(all, vec![json!({"n": 1}), json!({"n": 2})]);

        store.delete(CHAIN_TASKS, "a").await.unwrap();
        assert_eq!(store.len(CHAIN_TASKS), 1);
        assert_eq!(store.len(ACCOUNTS), 1);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let store = MemoryStore::new();
        store.delete(EVENTS, "nothing").await.unwrap();
        assert!(store.is_empty(EVENTS));
        assert!(store.get_all_objects(EVENTS).await.unwrap().is_empty());
    }
}
