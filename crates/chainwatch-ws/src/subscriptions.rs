//! Storage subscription bookkeeping.
//!
//! A `state_subscribeStorage` subscription watches a set of distinct keys,
//! but the multiplexer expects one value per slot of its call list, in
//! order. The manager keeps the slot layout and the latest value of every
//! key, and turns each `state_storage` change set into a full tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use chainwatch_core::SubscriptionId;

use crate::rpc::StorageChangeSet;

struct StorageSubscription {
    /// Storage key per slot; a key may occupy several slots.
    slots: Vec<String>,
    /// Latest raw value per slot; `Null` until first reported.
    latest: Vec<Value>,
    sender: mpsc::UnboundedSender<Vec<Value>>,
}

/// Active storage subscriptions of one connection.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, StorageSubscription>>>,
}

/// Distinct keys of `slots`, in first-seen order.
pub fn unique_keys(slots: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(slots.len());
    for key in slots {
        if !keys.contains(key) {
            keys.push(key.clone());
        }
    }
    keys
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription over `slots`.
    pub fn register(&self, id: SubscriptionId, slots: Vec<String>) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let latest = vec![Value::Null; slots.len()];
        self.entries.lock().unwrap().insert(
            id,
            StorageSubscription {
                slots,
                latest,
                sender: tx,
            },
        );
        rx
    }

    /// Apply a change set and forward the resulting tick. Returns `false`
    /// if the subscription is unknown or its receiver is gone.
    pub fn dispatch(&self, id: &SubscriptionId, changes: StorageChangeSet) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(sub) = entries.get_mut(id) else {
            return false;
        };
        for (key, value) in changes.changes {
            let value = value.map(Value::String).unwrap_or(Value::Null);
            for (slot, slot_key) in sub.slots.iter().enumerate() {
                if *slot_key == key {
                    sub.latest[slot] = value.clone();
                }
            }
        }
        sub.sender.send(sub.latest.clone()).is_ok()
    }

    /// Forget a subscription; its receiver sees the stream end.
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    /// Forget every subscription (connection closed).
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(pairs: &[(&str, Option<&str>)]) -> StorageChangeSet {
        StorageChangeSet {
            block: "0x01".into(),
            changes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        }
    }

    #[test]
    fn unique_keys_keep_first_order() {
        let slots = vec!["0xb".to_string(), "0xa".to_string(), "0xb".to_string()];
        assert_eq!(unique_keys(&slots), vec!["0xb".to_string(), "0xa".to_string()]);
    }

    #[test]
    fn dispatch_fills_every_slot_of_a_key() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("sub-1".into());
        let mut rx = mgr.register(id.clone(), vec!["0xa".into(), "0xb".into(), "0xa".into()]);

        assert!(mgr.dispatch(&id, changes(&[("0xa", Some("0x01")), ("0xb", Some("0x02"))])));
        assert_eq!(
            rx.try_recv().unwrap(),
            vec![Value::from("0x01"), Value::from("0x02"), Value::from("0x01")]
        );
    }

    #[test]
    fn partial_change_set_keeps_previous_values() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("sub-1".into());
        let mut rx = mgr.register(id.clone(), vec!["0xa".into(), "0xb".into()]);

        mgr.dispatch(&id, changes(&[("0xa", Some("0x01")), ("0xb", Some("0x02"))]));
        mgr.dispatch(&id, changes(&[("0xb", None)]));
        rx.try_recv().unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![Value::from("0x01"), Value::Null]);
    }

    #[test]
    fn removed_subscription_ends_stream() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("sub-1".into());
        let mut rx = mgr.register(id.clone(), vec!["0xa".into()]);
        assert!(mgr.remove(&id));
        assert!(mgr.is_empty());
        assert!(!mgr.dispatch(&id, changes(&[("0xa", Some("0x01"))])));
        assert!(rx.try_recv().is_err());
    }
}
