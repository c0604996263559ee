//! Multiplexer — batches a scope's logical subscriptions into one physical
//! subscription per chain and deduplicates what it streams.
//!
//! # Rebuild
//! Every change to a chain's entry list runs a rebuild while holding that
//! chain's state lock:
//!
//! ```text
//! unsubscribe old physical call ─► (list empty? stop)
//!        ─► ConnectionRegistry::ensure_connected
//!        ─► subscribe(one QueryCall per entry, list order)
//!        ─► store handle + frozen plan, bump generation, spawn pump
//! ```
//!
//! Rebuilds for one chain are therefore serialized and never overlap; a
//! change issued mid-rebuild waits and triggers the next rebuild. The pump
//! task of a superseded subscription sees a generation mismatch and drops
//! its ticks.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::catalog::{ChainQuery, ChangePolicy, QueryCatalog};
use crate::client::SubscriptionId;
use crate::connection::{Connection, ConnectionRegistry};
use crate::dispatcher::Dispatcher;
use crate::error::WatchError;
use crate::task::{ChainId, SubscriptionTask};

/// Owner of a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Account { chain_id: ChainId, address: String },
    /// The shared chain-level ("chain debugging") scope.
    Chain,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account { chain_id, address } => write!(f, "account {address} on {chain_id}"),
            Self::Chain => write!(f, "chain"),
        }
    }
}

/// Identifier of a call entry, unique within one multiplexer.
pub type EntryId = u64;

/// One change to an entry list, applied by [`Multiplexer::apply_batch`].
#[derive(Debug, Clone)]
pub enum BatchOp {
    Subscribe(SubscriptionTask),
    /// Remove the entry for this action.
    Unsubscribe(String),
}

/// Counters for one multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexStats {
    pub dispatched: u64,
    pub deduplicated: u64,
    pub stale_discarded: u64,
    pub decode_errors: u64,
    pub rebuilds: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    deduplicated: AtomicU64,
    stale_discarded: AtomicU64,
    decode_errors: AtomicU64,
    rebuilds: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Last value observed for an entry; only used for change detection.
#[derive(Debug, Clone)]
struct ObservedValue {
    hash: [u8; 32],
    value: Value,
}

struct CallEntry {
    id: EntryId,
    task: SubscriptionTask,
    query: Arc<dyn ChainQuery>,
    cur_val: Option<ObservedValue>,
}

/// Slot of a physical subscription: which entry it feeds and how to decode.
#[derive(Clone)]
struct PlanSlot {
    entry: EntryId,
    query: Arc<dyn ChainQuery>,
}

struct LiveSubscription {
    id: SubscriptionId,
    generation: u64,
    connection: Arc<Connection>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct MultiplexState {
    entries: Vec<CallEntry>,
    live: Option<LiveSubscription>,
    generation: u64,
}

impl LiveSubscription {
    /// Still streaming: the connection is up and the pump is running.
    fn is_serving(&self) -> bool {
        self.connection.is_connected() && !self.pump.is_finished()
    }
}

impl MultiplexState {
    fn live_generation(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.generation)
    }

    fn is_serving(&self) -> bool {
        self.live.as_ref().map_or(false, LiveSubscription::is_serving)
    }
}

type ChainState = Arc<tokio::sync::Mutex<MultiplexState>>;

// ─── Multiplexer ─────────────────────────────────────────────────────────────

pub struct Multiplexer {
    scope: Scope,
    connections: Arc<ConnectionRegistry>,
    catalog: Arc<dyn QueryCatalog>,
    dispatcher: Arc<Dispatcher>,
    states: Mutex<HashMap<ChainId, ChainState>>,
    next_entry: AtomicU64,
    counters: Arc<Counters>,
}

impl Multiplexer {
    pub fn new(
        scope: Scope,
        connections: Arc<ConnectionRegistry>,
        catalog: Arc<dyn QueryCatalog>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            scope,
            connections,
            catalog,
            dispatcher,
            states: Mutex::new(HashMap::new()),
            next_entry: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn state(&self, chain_id: &str) -> ChainState {
        Arc::clone(
            self.states
                .lock()
                .unwrap()
                .entry(chain_id.to_string())
                .or_default(),
        )
    }

    fn existing_state(&self, chain_id: &str) -> Option<ChainState> {
        self.states.lock().unwrap().get(chain_id).cloned()
    }

    fn existing_states(&self) -> Vec<(ChainId, ChainState)> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    /// Add `task`'s entry and rebuild. A no-op if an entry for the same
    /// action already exists with the same arguments.
    pub async fn subscribe(&self, task: SubscriptionTask) -> Result<(), WatchError> {
        let chain_id = task.chain_id.clone();
        self.apply_batch(&chain_id, vec![BatchOp::Subscribe(task)]).await
    }

    /// Remove the entry for `action`. An emptied list tears the physical
    /// subscription down. A no-op if no such entry exists.
    pub async fn unsubscribe(&self, chain_id: &str, action: &str) -> Result<(), WatchError> {
        self.apply_batch(chain_id, vec![BatchOp::Unsubscribe(action.to_string())])
            .await
    }

    /// Apply `ops` to the chain's entry list in order, then rebuild once.
    ///
    /// Rejected subscribe ops (unknown action, wrong scope, bad arguments)
    /// are skipped; the rest still apply and the first rejection is
    /// returned after the rebuild. A rebuild failure takes precedence.
    pub async fn apply_batch(&self, chain_id: &str, ops: Vec<BatchOp>) -> Result<(), WatchError> {
        let state = self.state(chain_id);
        let mut state = state.lock().await;

        let mut dirty = false;
        let mut wants_live = false;
        let mut rejected: Option<WatchError> = None;

        for op in ops {
            match op {
                BatchOp::Subscribe(task) => {
                    wants_live = true;
                    match self.add_entry(&mut state, chain_id, task) {
                        Ok(changed) => dirty |= changed,
                        Err(e) => {
                            tracing::warn!(scope = %self.scope, chain_id, error = %e, "subscribe rejected");
                            rejected.get_or_insert(e);
                        }
                    }
                }
                BatchOp::Unsubscribe(action) => {
                    let before = state.entries.len();
                    state.entries.retain(|e| e.task.action != action);
                    dirty |= state.entries.len() != before;
                }
            }
        }

        // A subscribe against entries that are not live retries the rebuild.
        let retry = wants_live && !state.is_serving() && !state.entries.is_empty();
        if dirty || retry {
            self.rebuild_locked(chain_id, &mut state).await?;
        }

        match rejected {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn add_entry(
        &self,
        state: &mut MultiplexState,
        chain_id: &str,
        task: SubscriptionTask,
    ) -> Result<bool, WatchError> {
        self.check_scope(chain_id, &task)?;
        let query = self.catalog.resolve(chain_id, &task.action)?;
        query.call(&task)?;

        if let Some(existing) = state.entries.iter_mut().find(|e| e.task.action == task.action) {
            let args_changed = existing.task.action_args != task.action_args;
            existing.task = task;
            if args_changed {
                existing.query = query;
                existing.cur_val = None;
            }
            return Ok(args_changed);
        }

        let id = self.next_entry.fetch_add(1, Ordering::Relaxed);
        state.entries.push(CallEntry {
            id,
            task,
            query,
            cur_val: None,
        });
        Ok(true)
    }

    fn check_scope(&self, chain_id: &str, task: &SubscriptionTask) -> Result<(), WatchError> {
        let in_scope = task.chain_id == chain_id
            && match (&self.scope, &task.account) {
                (Scope::Chain, None) => true,
                (Scope::Account { chain_id: c, address }, Some(account)) => {
                    c == chain_id && *address == account.address
                }
                _ => false,
            };
        if in_scope {
            Ok(())
        } else {
            Err(WatchError::Other(format!(
                "task {} does not belong to {} on {chain_id}",
                task.key(),
                self.scope
            )))
        }
    }

    /// Re-establish the chain's physical subscription from its current
    /// entry list. Used after reconnects and endpoint switches.
    pub async fn rebuild(&self, chain_id: &str) -> Result<(), WatchError> {
        let state = self.state(chain_id);
        let mut state = state.lock().await;
        self.rebuild_locked(chain_id, &mut state).await
    }

    async fn rebuild_locked(
        &self,
        chain_id: &str,
        state: &mut MultiplexState,
    ) -> Result<(), WatchError> {
        Counters::bump(&self.counters.rebuilds);

        // The old pump exits on its next tick (generation mismatch) or when
        // the client closes its stream.
        if let Some(old) = state.live.take() {
            if let Err(e) = old.connection.client().unsubscribe(&old.id).await {
                // The old handle is already invalid (e.g. the socket dropped).
                tracing::debug!(chain_id, subscription = %old.id, error = %e, "stale unsubscribe failed");
            }
            tracing::debug!(chain_id, generation = old.generation, "physical subscription closed");
        }

        if state.entries.is_empty() {
            tracing::debug!(scope = %self.scope, chain_id, "no entries left; nothing to subscribe");
            return Ok(());
        }

        // Connection failures keep their own variant.
        let connection = self.connections.ensure_connected(chain_id).await?;

        let mut calls = Vec::with_capacity(state.entries.len());
        let mut plan = Vec::with_capacity(state.entries.len());
        for entry in &state.entries {
            calls.push(
                entry
                    .query
                    .call(&entry.task)
                    .map_err(|e| WatchError::rebuild(chain_id, e))?,
            );
            plan.push(PlanSlot {
                entry: entry.id,
                query: Arc::clone(&entry.query),
            });
        }

        let subscription = connection
            .client()
            .subscribe(calls)
            .await
            .map_err(|e| {
                tracing::error!(scope = %self.scope, chain_id, error = %e, "physical subscribe failed");
                WatchError::rebuild(chain_id, e)
            })?;

        state.generation += 1;
        let generation = state.generation;
        let pump = self.spawn_pump(chain_id, generation, plan, subscription.ticks);

        tracing::info!(
            scope = %self.scope,
            chain_id,
            generation,
            entries = state.entries.len(),
            subscription = %subscription.id,
            "physical subscription established"
        );

        state.live = Some(LiveSubscription {
            id: subscription.id,
            generation,
            connection,
            pump,
        });
        Ok(())
    }

    fn spawn_pump(
        &self,
        chain_id: &str,
        generation: u64,
        plan: Vec<PlanSlot>,
        mut ticks: mpsc::UnboundedReceiver<Vec<Value>>,
    ) -> JoinHandle<()> {
        let state = self.state(chain_id);
        let dispatcher = Arc::clone(&self.dispatcher);
        let counters = Arc::clone(&self.counters);
        let chain_id = chain_id.to_string();

        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                let changed = {
                    let mut state = state.lock().await;
                    accept_tick(&mut state, generation, &plan, tick, &counters)
                };
                let Some(changed) = changed else {
                    tracing::debug!(chain_id = %chain_id, generation, "discarding tick from superseded subscription");
                    break;
                };
                for (task, value) in changed {
                    Counters::bump(&counters.dispatched);
                    dispatcher.dispatch(&task, &value).await;
                }
            }
            tracing::debug!(chain_id = %chain_id, generation, "subscription stream ended");
        })
    }

    /// Drop every entry on every chain and close all physical subscriptions.
    pub async fn teardown(&self) {
        for (chain_id, state) in self.existing_states() {
            let mut state = state.lock().await;
            state.entries.clear();
            if let Err(e) = self.rebuild_locked(&chain_id, &mut state).await {
                tracing::warn!(scope = %self.scope, chain_id = %chain_id, error = %e, "teardown failed");
            }
        }
    }

    /// Returns `true` if the chain has at least one entry.
    pub async fn has_entries(&self, chain_id: &str) -> bool {
        self.entry_count(chain_id).await > 0
    }

    /// Returns `true` if any chain has at least one entry.
    pub async fn has_any_entries(&self) -> bool {
        for (_, state) in self.existing_states() {
            if !state.lock().await.entries.is_empty() {
                return true;
            }
        }
        false
    }

    pub async fn entry_count(&self, chain_id: &str) -> usize {
        match self.existing_state(chain_id) {
            Some(state) => state.lock().await.entries.len(),
            None => 0,
        }
    }

    /// Returns `true` if a physical subscription is streaming on a
    /// connected connection.
    pub async fn is_live(&self, chain_id: &str) -> bool {
        match self.existing_state(chain_id) {
            Some(state) => state.lock().await.is_serving(),
            None => false,
        }
    }

    /// Tasks currently held as entries on `chain_id`, in entry order.
    pub async fn tasks(&self, chain_id: &str) -> Vec<SubscriptionTask> {
        match self.existing_state(chain_id) {
            Some(state) => state
                .lock()
                .await
                .entries
                .iter()
                .map(|e| e.task.clone())
                .collect(),
            None => vec![],
        }
    }

    /// Chains with at least one entry, sorted.
    pub async fn chains(&self) -> Vec<ChainId> {
        let mut chains = vec![];
        for (chain_id, state) in self.existing_states() {
            if !state.lock().await.entries.is_empty() {
                chains.push(chain_id);
            }
        }
        chains.sort();
        chains
    }

    pub fn stats(&self) -> MultiplexStats {
        let c = &self.counters;
        MultiplexStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            stale_discarded: c.stale_discarded.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            rebuilds: c.rebuilds.load(Ordering::Relaxed),
        }
    }
}

// ─── Tick processing ─────────────────────────────────────────────────────────

fn content_hash(value: &Value) -> [u8; 32] {
    // serde_json objects are key-sorted, so the serialization is canonical.
    Sha256::digest(value.to_string().as_bytes()).into()
}

fn numeric(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn is_change(prev: Option<&ObservedValue>, hash: &[u8; 32], value: &Value, policy: ChangePolicy) -> bool {
    let Some(prev) = prev else {
        return true;
    };
    if prev.hash == *hash {
        return false;
    }
    match policy {
        ChangePolicy::Exact => true,
        ChangePolicy::MonotonicWithTolerance(tolerance) => {
            match (numeric(&prev.value), numeric(value)) {
                (Some(old), Some(new)) => new >= old.saturating_add(u128::from(tolerance)),
                _ => true,
            }
        }
    }
}

/// Process one tick against the state. Returns `None` if the tick belongs
/// to a superseded subscription, otherwise the entries whose value changed.
fn accept_tick(
    state: &mut MultiplexState,
    generation: u64,
    plan: &[PlanSlot],
    tick: Vec<Value>,
    counters: &Counters,
) -> Option<Vec<(SubscriptionTask, Value)>> {
    if state.live_generation() != Some(generation) {
        Counters::bump(&counters.stale_discarded);
        return None;
    }
    if tick.len() != plan.len() {
        tracing::warn!(expected = plan.len(), got = tick.len(), "tick width does not match plan");
        return Some(vec![]);
    }

    let mut changed = vec![];
    for (slot, raw) in plan.iter().zip(tick) {
        let Some(entry) = state.entries.iter_mut().find(|e| e.id == slot.entry) else {
            continue;
        };
        let value = match slot.query.decode(&raw) {
            Ok(v) => v,
            Err(e) => {
                Counters::bump(&counters.decode_errors);
                tracing::warn!(action = %entry.task.action, error = %e, "failed to decode streamed value");
                continue;
            }
        };
        let hash = content_hash(&value);
        if !is_change(entry.cur_val.as_ref(), &hash, &value, slot.query.change_policy()) {
            Counters::bump(&counters.deduplicated);
            continue;
        }
        entry.cur_val = Some(ObservedValue {
            hash,
            value: value.clone(),
        });
        changed.push((entry.task.clone(), value));
    }
    Some(changed)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PassthroughQuery, StaticCatalog};
    use crate::client::ChainClient;
    use crate::config::ChainConfig;
    use crate::dispatcher::{ChainEvent, DisplayNames};
    use crate::memory::MemoryClientFactory;
    use crate::task::TaskStatus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const CHAIN: &str = "Polkadot Relay";

    struct Fixture {
        factory: Arc<MemoryClientFactory>,
        mux: Multiplexer,
        events: broadcast::Receiver<ChainEvent>,
    }

    fn fixture() -> Fixture {
        let factory = Arc::new(MemoryClientFactory::new());
        let connections = Arc::new(ConnectionRegistry::new(
            factory.clone(),
            &[ChainConfig::new(CHAIN, "wss://rpc.polkadot.io")],
        ));
        let mut catalog = StaticCatalog::new();
        for action in ["chain:a", "chain:b", "chain:c"] {
            catalog.register(Arc::new(PassthroughQuery::new(action)));
        }
        catalog.register(Arc::new(
            PassthroughQuery::new("chain:timestamp")
                .with_policy(ChangePolicy::MonotonicWithTolerance(1_000)),
        ));
        let dispatcher = Arc::new(Dispatcher::new(64, DisplayNames::new()));
        let events = dispatcher.subscribe();
        let mux = Multiplexer::new(Scope::Chain, connections, Arc::new(catalog), dispatcher);
        Fixture { factory, mux, events }
    }

    fn task(action: &str) -> SubscriptionTask {
        SubscriptionTask::chain(CHAIN, action, action).with_status(TaskStatus::Enable)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChainEvent>) -> ChainEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let f = fixture();
        f.mux.subscribe(task("chain:a")).await.unwrap();
        f.mux.subscribe(task("chain:a")).await.unwrap();

        let client = f.factory.client(CHAIN);
        assert_eq!(f.mux.entry_count(CHAIN).await, 1);
        assert_eq!(client.subscribe_log().len(), 1);
        assert_eq!(client.live_count(), 1);
    }

    #[tokio::test]
    async fn unknown_action_fails_without_touching_state() {
        let f = fixture();
        let err = f.mux.subscribe(task("chain:zzz")).await.unwrap_err();
        assert!(matches!(err, WatchError::ActionNotFound { .. }));
        assert_eq!(f.mux.entry_count(CHAIN).await, 0);
        assert!(f.factory.client(CHAIN).subscribe_log().is_empty());
    }

    #[tokio::test]
    async fn rejects_task_from_other_scope() {
        let f = fixture();
        let foreign = SubscriptionTask::account(
            crate::task::AccountRef {
                address: "1x".into(),
                chain_id: CHAIN.into(),
                name: "x".into(),
            },
            "chain:a",
            "a",
        );
        assert!(f.mux.subscribe(foreign).await.is_err());
        assert_eq!(f.mux.entry_count(CHAIN).await, 0);
    }

    #[tokio::test]
    async fn one_physical_subscription_carries_every_entry_in_order() {
        let f = fixture();
        f.mux.subscribe(task("chain:a")).await.unwrap();
        f.mux.subscribe(task("chain:b")).await.unwrap();
        f.mux.subscribe(task("chain:c")).await.unwrap();

        let client = f.factory.client(CHAIN);
        assert_eq!(client.live_count(), 1);
        let keys: Vec<_> = client.latest_calls().unwrap().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["chain:a", "chain:b", "chain:c"]);

        f.mux.unsubscribe(CHAIN, "chain:b").await.unwrap();
        let keys: Vec<_> = client.latest_calls().unwrap().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["chain:a", "chain:c"]);
        assert_eq!(client.live_count(), 1);
    }

    #[tokio::test]
    async fn identical_value_is_not_redispatched() {
        let mut f = fixture();
        f.mux.subscribe(task("chain:a")).await.unwrap();
        let client = f.factory.client(CHAIN);

        client.emit(vec![json!({"free": 100})]);
        client.emit(vec![json!({"free": 100})]);
        client.emit(vec![json!({"free": 90})]);

        assert_eq!(next_event(&mut f.events).await.data, json!({"free": 100}));
        assert_eq!(next_event(&mut f.events).await.data, json!({"free": 90}));
        assert_eq!(f.mux.stats().deduplicated, 1);
        assert_eq!(f.mux.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn timestamp_needs_to_clear_tolerance() {
        let mut f = fixture();
        f.mux.subscribe(task("chain:timestamp")).await.unwrap();
        let client = f.factory.client(CHAIN);

        client.emit(vec![json!(10_000)]);
        client.emit(vec![json!(10_400)]);
        client.emit(vec![json!(10_999)]);
        client.emit(vec![json!(11_000)]);

        assert_eq!(next_event(&mut f.events).await.data, json!(10_000));
        assert_eq!(next_event(&mut f.events).await.data, json!(11_000));
        assert_eq!(f.mux.stats().deduplicated, 2);
    }

    #[tokio::test]
    async fn emptied_list_closes_physical_subscription() {
        let f = fixture();
        f.mux.subscribe(task("chain:a")).await.unwrap();
        f.mux.unsubscribe(CHAIN, "chain:a").await.unwrap();

        let client = f.factory.client(CHAIN);
        assert_eq!(client.live_count(), 0);
        assert!(!f.mux.is_live(CHAIN).await);
        // Releasing the last entry does not close the connection.
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_noop() {
        let f = fixture();
        f.mux.unsubscribe(CHAIN, "chain:a").await.unwrap();
        assert_eq!(f.mux.stats().rebuilds, 0);
    }

    #[tokio::test]
    async fn failed_subscribe_keeps_entries_for_retry() {
        let f = fixture();
        let client = f.factory.client(CHAIN);
        client.fail_next_subscribes(1);

        let err = f.mux.subscribe(task("chain:a")).await.unwrap_err();
        assert!(matches!(err, WatchError::RebuildFailure { .. }));
        assert_eq!(f.mux.entry_count(CHAIN).await, 1);
        assert!(!f.mux.is_live(CHAIN).await);

        f.mux.rebuild(CHAIN).await.unwrap();
        assert!(f.mux.is_live(CHAIN).await);
    }

    #[tokio::test]
    async fn connection_failure_is_reported_as_such() {
        let f = fixture();
        f.factory.client(CHAIN).fail_next_connects(1);

        let err = f.mux.subscribe(task("chain:a")).await.unwrap_err();
        assert!(matches!(err, WatchError::ConnectionFailure { .. }));
        assert!(err.is_retryable());
        assert_eq!(f.mux.entry_count(CHAIN).await, 1);

        f.mux.rebuild(CHAIN).await.unwrap();
        assert!(f.mux.is_live(CHAIN).await);
    }

    #[tokio::test]
    async fn tick_queued_before_rebuild_is_discarded() {
        let mut f = fixture();
        f.mux.subscribe(task("chain:a")).await.unwrap();
        let client = f.factory.client(CHAIN);

        // Queued on generation 1; its pump has not run yet when the
        // rebuild to generation 2 completes.
        assert!(client.emit(vec![json!("old")]));
        f.mux.subscribe(task("chain:b")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.mux.stats().stale_discarded == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale tick was never processed");
        assert_eq!(f.mux.stats().stale_discarded, 1);
        assert_eq!(f.mux.stats().dispatched, 0);
        assert!(f.events.try_recv().is_err());

        // The current generation still streams.
        assert!(client.emit(vec![json!("a1"), json!("b1")]));
        assert_eq!(next_event(&mut f.events).await.data, json!("a1"));
        assert_eq!(next_event(&mut f.events).await.data, json!("b1"));
    }

    #[tokio::test]
    async fn disable_during_rebuild_leaves_nothing_live() {
        let f = fixture();
        let client = f.factory.client(CHAIN);
        client.set_subscribe_delay(Some(Duration::from_millis(50)));

        let mux = Arc::new(f.mux);
        let enabling = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.subscribe(task("chain:a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mux.unsubscribe(CHAIN, "chain:a").await.unwrap();
        enabling.await.unwrap().unwrap();

        assert_eq!(mux.entry_count(CHAIN).await, 0);
        assert_eq!(client.live_count(), 0);
        assert!(!mux.is_live(CHAIN).await);
    }

    #[test]
    fn stale_generation_is_discarded() {
        let counters = Counters::default();
        let mut state = MultiplexState::default();
        let plan = vec![PlanSlot {
            entry: 1,
            query: Arc::new(PassthroughQuery::new("chain:a")),
        }];
        state.entries.push(CallEntry {
            id: 1,
            task: task("chain:a"),
            query: Arc::new(PassthroughQuery::new("chain:a")),
            cur_val: None,
        });

        // No live subscription at all: every generation is stale.
        assert!(accept_tick(&mut state, 1, &plan, vec![json!(1)], &counters).is_none());
        assert_eq!(counters.stale_discarded.load(Ordering::Relaxed), 1);
        assert!(state.entries[0].cur_val.is_none());
    }

    #[test]
    fn monotonic_policy_accepts_first_and_non_numeric() {
        let v = json!("abc");
        assert!(is_change(None, &content_hash(&v), &v, ChangePolicy::MonotonicWithTolerance(5)));
        let prev = ObservedValue {
            hash: content_hash(&json!("abc")),
            value: json!("abc"),
        };
        let next = json!("abd");
        assert!(is_change(Some(&prev), &content_hash(&next), &next, ChangePolicy::MonotonicWithTolerance(5)));
    }
}
