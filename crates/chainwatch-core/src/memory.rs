//! In-memory chain client for tests, demos and dry runs.
//!
//! [`MemoryClient`] behaves like a chain node that accepts multiplexed
//! subscriptions and streams whatever the caller pushes with [`MemoryClient::emit`].
//! Connection and subscription failures can be injected.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::client::{ChainClient, ClientFactory, PhysicalSubscription, QueryCall, SubscriptionId};
use crate::error::WatchError;

struct LiveSub {
    calls: Vec<QueryCall>,
    tx: mpsc::UnboundedSender<Vec<Value>>,
}

#[derive(Default)]
struct Inner {
    connected: bool,
    endpoint: Option<String>,
    connects: usize,
    fail_connects: usize,
    fail_subscribes: usize,
    subscribe_delay: Option<Duration>,
    next_id: u64,
    live: BTreeMap<u64, LiveSub>,
    subscribe_log: Vec<Vec<QueryCall>>,
    unsubscribes: usize,
    call_results: HashMap<String, Value>,
}

/// Scriptable in-memory [`ChainClient`].
pub struct MemoryClient {
    chain_id: String,
    inner: Mutex<Inner>,
}

impl MemoryClient {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.lock().unwrap().fail_connects = n;
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.lock().unwrap().fail_subscribes = n;
    }

    /// Delay every subscribe call, to widen race windows in tests.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().subscribe_delay = delay;
    }

    /// Canned result for `call(method, ..)`.
    pub fn set_call_result(&self, method: impl Into<String>, result: Value) {
        self.inner
            .lock()
            .unwrap()
            .call_results
            .insert(method.into(), result);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().connects
    }

    /// Endpoint of the last successful connect.
    pub fn endpoint(&self) -> Option<String> {
        self.inner.lock().unwrap().endpoint.clone()
    }

    /// Number of physical subscriptions currently open.
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// The slots of every subscribe call issued so far, in order.
    pub fn subscribe_log(&self) -> Vec<Vec<QueryCall>> {
        self.inner.lock().unwrap().subscribe_log.clone()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.inner.lock().unwrap().unsubscribes
    }

    /// Slots of the most recently opened live subscription.
    pub fn latest_calls(&self) -> Option<Vec<QueryCall>> {
        self.inner
            .lock()
            .unwrap()
            .live
            .values()
            .next_back()
            .map(|s| s.calls.clone())
    }

    /// Push a tick to the most recently opened live subscription.
    /// Returns `false` if none is open.
    pub fn emit(&self, values: Vec<Value>) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.live.values().next_back() {
            Some(sub) => sub.tx.send(values).is_ok(),
            None => false,
        }
    }

    /// Push a tick built from storage key → value pairs; slots without a
    /// pair are `Null`.
    pub fn emit_keys(&self, values: &[(&str, Value)]) -> bool {
        let Some(calls) = self.latest_calls() else {
            return false;
        };
        let tick = calls
            .iter()
            .map(|c| {
                values
                    .iter()
                    .find(|(k, _)| *k == c.key)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null)
            })
            .collect();
        self.emit(tick)
    }

    /// Simulate the node dropping the socket.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.live.clear();
    }
}

#[async_trait]
impl ChainClient for MemoryClient {
    async fn connect(&self, endpoint: &str) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(WatchError::Transport(format!("connection to {endpoint} refused")));
        }
        inner.connected = true;
        inner.endpoint = Some(endpoint.to_string());
        inner.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.live.clear();
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    async fn call(&self, method: &str, _params: Vec<Value>) -> Result<Value, WatchError> {
        let inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(WatchError::Transport("not connected".into()));
        }
        Ok(inner.call_results.get(method).cloned().unwrap_or(Value::Null))
    }

    async fn subscribe(&self, calls: Vec<QueryCall>) -> Result<PhysicalSubscription, WatchError> {
        let delay = self.inner.lock().unwrap().subscribe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(WatchError::Transport("not connected".into()));
        }
        if inner.fail_subscribes > 0 {
            inner.fail_subscribes -= 1;
            return Err(WatchError::Transport("subscription rejected".into()));
        }

        inner.next_id += 1;
        let n = inner.next_id;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribe_log.push(calls.clone());
        inner.live.insert(n, LiveSub { calls, tx });

        Ok(PhysicalSubscription {
            id: SubscriptionId(format!("mem-{n}")),
            ticks: rx,
        })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), WatchError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(n) = id.0.strip_prefix("mem-").and_then(|n| n.parse::<u64>().ok()) {
            inner.live.remove(&n);
        }
        inner.unsubscribes += 1;
        Ok(())
    }
}

/// Factory handing out one shared [`MemoryClient`] per chain.
#[derive(Default)]
pub struct MemoryClientFactory {
    clients: Mutex<HashMap<String, Arc<MemoryClient>>>,
}

impl MemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chain's client, created on first use.
    pub fn client(&self, chain_id: &str) -> Arc<MemoryClient> {
        Arc::clone(
            self.clients
                .lock()
                .unwrap()
                .entry(chain_id.to_string())
                .or_insert_with(|| Arc::new(MemoryClient::new(chain_id))),
        )
    }
}

impl ClientFactory for MemoryClientFactory {
    fn create(&self, chain_id: &str) -> Arc<dyn ChainClient> {
        self.client(chain_id)
    }
}
