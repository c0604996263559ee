//! Dispatcher — turns a changed value into an event and publishes it.
//!
//! Every event goes to the UI broadcast channel and, when configured, to the
//! persistent [`EventLog`]. Tasks with OS notifications enabled also reach the
//! [`NotificationSink`]. Sink failures are logged; they never flow back into
//! the multiplexer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::error::WatchError;
use crate::store::{KeyValueStore, EVENTS};
use crate::task::{ChainId, SubscriptionTask};

// ─── Event types ─────────────────────────────────────────────────────────────

/// Who an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "camelCase")]
pub enum EventOrigin {
    #[serde(rename_all = "camelCase")]
    Account {
        chain_id: ChainId,
        address: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    Chain { chain_id: ChainId },
}

/// A rendered notification event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub uid: String,
    pub category: String,
    pub who: EventOrigin,
    pub task_action: String,
    pub title: String,
    pub subtitle: String,
    pub data: Value,
    /// Unix seconds.
    pub timestamp: i64,
    pub stale: bool,
}

// ─── Collaborators ───────────────────────────────────────────────────────────

/// OS-level notification sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event_id: &str, title: &str, body: &str);
}

/// Persistent in-app event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn record(&self, event: &ChainEvent) -> Result<(), WatchError>;
}

/// [`EventLog`] writing each event to the `events` store under its uid.
pub struct StoreEventLog {
    store: Arc<dyn KeyValueStore>,
}

impl StoreEventLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventLog for StoreEventLog {
    async fn record(&self, event: &ChainEvent) -> Result<(), WatchError> {
        self.store
            .set(EVENTS, &event.uid, serde_json::to_value(event)?)
            .await
    }
}

/// Delete logged events older than `cutoff` (unix seconds). Records without
/// a readable timestamp are removed too. Returns the number deleted.
pub async fn prune_events(store: &dyn KeyValueStore, cutoff: i64) -> Result<usize, WatchError> {
    let mut removed = 0;
    for (uid, event) in store.get_all_objects(EVENTS).await? {
        let expired = event
            .get("timestamp")
            .and_then(Value::as_i64)
            .map_or(true, |ts| ts < cutoff);
        if expired {
            store.delete(EVENTS, &uid).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::debug!(removed, cutoff, "pruned event log");
    }
    Ok(removed)
}

// ─── DisplayNames ────────────────────────────────────────────────────────────

/// Current account display names, shared between the account registry
/// (writer) and the dispatcher (reader).
#[derive(Clone, Default)]
pub struct DisplayNames(Arc<RwLock<HashMap<(ChainId, String), String>>>);

impl DisplayNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, chain_id: &str, address: &str, name: &str) {
        self.0
            .write()
            .unwrap()
            .insert((chain_id.to_string(), address.to_string()), name.to_string());
    }

    pub fn get(&self, chain_id: &str, address: &str) -> Option<String> {
        self.0
            .read()
            .unwrap()
            .get(&(chain_id.to_string(), address.to_string()))
            .cloned()
    }

    pub fn remove(&self, chain_id: &str, address: &str) {
        self.0
            .write()
            .unwrap()
            .remove(&(chain_id.to_string(), address.to_string()));
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct Dispatcher {
    tx: broadcast::Sender<ChainEvent>,
    log: Option<Arc<dyn EventLog>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    names: DisplayNames,
    seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(channel_capacity: usize, names: DisplayNames) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            tx,
            log: None,
            notifier: None,
            names,
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_event_log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Subscribe to the UI event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }

    pub fn names(&self) -> &DisplayNames {
        &self.names
    }

    /// Number of events dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Publish the event for `(task, value)`.
    pub async fn dispatch(&self, task: &SubscriptionTask, value: &Value) {
        let event = self.render(task, value);
        tracing::debug!(
            uid = %event.uid,
            chain_id = %task.chain_id,
            action = %task.action,
            "dispatching event"
        );

        if let Some(log) = &self.log {
            if let Err(e) = log.record(&event).await {
                tracing::warn!(uid = %event.uid, error = %e, "failed to persist event");
            }
        }

        if task.os_notifications() {
            if let Some(notifier) = &self.notifier {
                notifier.notify(&event.uid, &event.title, &event.subtitle);
            }
        }

        // No receivers is not an error.
        let _ = self.tx.send(event);
    }

    /// Build the event payload for `(task, value)`.
    pub fn render(&self, task: &SubscriptionTask, value: &Value) -> ChainEvent {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now();

        let who = match &task.account {
            Some(account) => EventOrigin::Account {
                chain_id: task.chain_id.clone(),
                address: account.address.clone(),
                name: self
                    .names
                    .get(&task.chain_id, &account.address)
                    .unwrap_or_else(|| account.name.clone()),
            },
            None => EventOrigin::Chain {
                chain_id: task.chain_id.clone(),
            },
        };
        let subject = match &who {
            EventOrigin::Account { name, .. } => name.clone(),
            EventOrigin::Chain { chain_id } => chain_id.clone(),
        };

        let (title, subtitle) = describe(task, &subject, value);
        let category = if task.category.is_empty() {
            category_for(&task.action).to_string()
        } else {
            task.category.clone()
        };

        let mut hasher = Sha256::new();
        hasher.update(task.key().storage_key().as_bytes());
        hasher.update(value.to_string().as_bytes());
        hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(n.to_le_bytes());
        let uid = hex::encode(&hasher.finalize()[..16]);

        ChainEvent {
            uid,
            category,
            who,
            task_action: task.action.clone(),
            title,
            subtitle,
            data: value.clone(),
            timestamp: now.timestamp(),
            stale: false,
        }
    }
}

/// Display category derived from the action family.
pub fn category_for(action: &str) -> &'static str {
    match action.split(':').next().unwrap_or_default() {
        "balance" => "Balances",
        "nominationPools" => "Nomination Pools",
        "nominating" => "Nominating",
        "chain" => "Chain",
        _ => "Other",
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn describe(task: &SubscriptionTask, subject: &str, value: &Value) -> (String, String) {
    let (family, item) = task.action.split_once(':').unwrap_or((task.action.as_str(), ""));
    match family {
        "balance" => {
            let amount = value.get(item).map(plain).unwrap_or_else(|| plain(value));
            (
                format!("{} Balance", capitalize(item)),
                format!("{subject}: {item} balance is now {amount}"),
            )
        }
        "nominationPools" => (
            format!("Nomination Pool {}", capitalize(item)),
            format!("{subject}: pool {item} changed"),
        ),
        "nominating" => (
            format!("Nominating {}", capitalize(item)),
            format!("{subject}: nominating {item} changed"),
        ),
        "chain" if item == "timestamp" => ("Timestamp".into(), format!("{subject}: {}", plain(value))),
        "chain" if item == "currentSlot" => ("Current Slot".into(), format!("{subject}: slot {}", plain(value))),
        _ => (task.label.clone(), format!("{subject}: {}", plain(value))),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
