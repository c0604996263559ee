//! TaskOrchestrator — the single entry point for task changes.
//!
//! Every change is persisted first and then applied to the owning
//! multiplexer: an account's for account tasks, the shared chain multiplexer
//! otherwise. A failed rebuild never rolls the persisted status back; the
//! task stays enabled-but-unlive until a reconnect or [`TaskOrchestrator::resync`]
//! brings it up.
//!
//! Connections are closed only by [`TaskOrchestrator::disconnect_if_unused`],
//! after checking every consumer of the chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::accounts::{Account, AccountRecord, AccountRegistry};
use crate::catalog::QueryCatalog;
use crate::connection::ConnectionRegistry;
use crate::error::WatchError;
use crate::multiplexer::{BatchOp, Multiplexer};
use crate::store::{KeyValueStore, ACCOUNT_TASKS, CHAIN_TASKS};
use crate::task::{AccountRef, ChainId, SubscriptionTask, TaskKey, TaskState, TaskStatus};

/// Extrinsic-building consumer of connections. A chain it requires is never
/// closed by the unused-connection sweep.
pub trait ApiUsage: Send + Sync {
    fn requires_connection(&self, chain_id: &str) -> bool;
}

/// [`ApiUsage`] that never holds a connection.
pub struct NoApiUsage;

impl ApiUsage for NoApiUsage {
    fn requires_connection(&self, _chain_id: &str) -> bool {
        false
    }
}

/// An account with its full task catalog and current statuses.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSubscriptions {
    pub account: AccountRef,
    pub tasks: Vec<SubscriptionTask>,
}

// ─── Task templates ──────────────────────────────────────────────────────────

const BALANCE_ACTIONS: [(&str, &str); 4] = [
    ("balance:free", "Free Balance"),
    ("balance:reserved", "Reserved Balance"),
    ("balance:frozen", "Frozen Balance"),
    ("balance:spendable", "Spendable Balance"),
];

const POOL_ACTIONS: [(&str, &str); 4] = [
    ("nominationPools:rewards", "Pool Rewards"),
    ("nominationPools:state", "Pool State"),
    ("nominationPools:roles", "Pool Roles"),
    ("nominationPools:commission", "Pool Commission"),
];

const NOMINATING_ACTIONS: [(&str, &str); 3] = [
    ("nominating:exposure", "Nominating Exposure"),
    ("nominating:commission", "Validator Commission"),
    ("nominating:nominations", "Nominations"),
];

const CHAIN_ACTIONS: [(&str, &str); 2] = [
    ("chain:timestamp", "Timestamp"),
    ("chain:currentSlot", "Current Slot"),
];

/// Every task the account can have, all disabled. Pool and nominating tasks
/// only appear when the account has the matching on-chain data.
pub fn account_templates(record: &AccountRecord) -> Vec<SubscriptionTask> {
    let mut actions: Vec<(&str, &str, &str)> = BALANCE_ACTIONS
        .iter()
        .map(|(a, l)| (*a, *l, "Balances"))
        .collect();
    if record.nomination_pool.is_some() {
        actions.extend(POOL_ACTIONS.iter().map(|(a, l)| (*a, *l, "Nomination Pools")));
    }
    if record.nominating.is_some() {
        actions.extend(NOMINATING_ACTIONS.iter().map(|(a, l)| (*a, *l, "Nominating")));
    }

    let account = record.account_ref();
    actions
        .into_iter()
        .map(|(action, label, category)| {
            let task = SubscriptionTask::account(account.clone(), action, label).with_category(category);
            match record.storage_key_for(action) {
                Some(key) => task.with_args(vec![key.to_string()]),
                None => task,
            }
        })
        .collect()
}

/// Every chain-level task for `chain_id`, all disabled.
pub fn chain_templates(chain_id: &str) -> Vec<SubscriptionTask> {
    CHAIN_ACTIONS
        .iter()
        .map(|(action, label)| SubscriptionTask::chain(chain_id, *action, *label).with_category("Chain"))
        .collect()
}

/// Overlay the persisted-enabled tasks onto `catalog`. Matching templates
/// take the stored status, notification flag and arguments; the rest stay
/// disabled.
pub fn merge_with_catalog(
    catalog: Vec<SubscriptionTask>,
    persisted: &[SubscriptionTask],
) -> Vec<SubscriptionTask> {
    catalog
        .into_iter()
        .map(|template| {
            let key = template.key();
            match persisted.iter().find(|p| p.is_enabled() && p.key() == key) {
                Some(stored) => {
                    let mut task = template;
                    task.status = stored.status;
                    task.enable_os_notifications = stored.enable_os_notifications;
                    if stored.action_args.is_some() {
                        task.action_args = stored.action_args.clone();
                    }
                    task
                }
                None => template.with_status(TaskStatus::Disable),
            }
        })
        .collect()
}

// ─── TaskOrchestrator ────────────────────────────────────────────────────────

pub struct TaskOrchestrator {
    store: Arc<dyn KeyValueStore>,
    catalog: Arc<dyn QueryCatalog>,
    connections: Arc<ConnectionRegistry>,
    accounts: Arc<AccountRegistry>,
    chain_mux: Arc<Multiplexer>,
    api_usage: Arc<dyn ApiUsage>,
}

/// Tasks for one (multiplexer, chain) pair, in input order.
struct TaskGroup {
    mux: Arc<Multiplexer>,
    chain_id: ChainId,
    tasks: Vec<SubscriptionTask>,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn QueryCatalog>,
        connections: Arc<ConnectionRegistry>,
        accounts: Arc<AccountRegistry>,
        chain_mux: Arc<Multiplexer>,
    ) -> Self {
        Self {
            store,
            catalog,
            connections,
            accounts,
            chain_mux,
            api_usage: Arc::new(NoApiUsage),
        }
    }

    pub fn with_api_usage(mut self, api_usage: Arc<dyn ApiUsage>) -> Self {
        self.api_usage = api_usage;
        self
    }

    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        &self.accounts
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn chain_multiplexer(&self) -> &Arc<Multiplexer> {
        &self.chain_mux
    }

    fn multiplexer_for(&self, task: &SubscriptionTask) -> Result<Arc<Multiplexer>, WatchError> {
        match &task.account {
            None => Ok(Arc::clone(&self.chain_mux)),
            Some(account) => self
                .accounts
                .get(&task.chain_id, &account.address)
                .map(|a| Arc::clone(a.multiplexer()))
                .ok_or_else(|| WatchError::UnknownAccount {
                    chain_id: task.chain_id.clone(),
                    address: account.address.clone(),
                }),
        }
    }

    /// Reject enabled tasks that could never go live: unknown action or
    /// missing arguments.
    fn validate(&self, task: &SubscriptionTask) -> Result<(), WatchError> {
        if task.is_enabled() {
            let query = self.catalog.resolve(&task.chain_id, &task.action)?;
            query.call(task)?;
        }
        Ok(())
    }

    async fn persist(&self, task: &SubscriptionTask) -> Result<(), WatchError> {
        let store = if task.is_account_task() { ACCOUNT_TASKS } else { CHAIN_TASKS };
        self.store
            .set(store, &task.key().storage_key(), serde_json::to_value(task)?)
            .await
    }

    async fn live_state(mux: &Multiplexer, task: &SubscriptionTask) -> TaskState {
        if !task.is_enabled() {
            return TaskState::Disabled;
        }
        let present = mux
            .tasks(&task.chain_id)
            .await
            .iter()
            .any(|t| t.action == task.action);
        match (present, mux.is_live(&task.chain_id).await) {
            (false, _) => TaskState::PendingSubscribe,
            (true, true) => TaskState::Enabled,
            (true, false) => TaskState::EnabledButUnlive,
        }
    }

    // ─── Task changes ────────────────────────────────────────────────────────

    /// Persist `task`'s status and apply it to the owning multiplexer.
    pub async fn apply_task(&self, task: SubscriptionTask) -> Result<TaskState, WatchError> {
        let mux = self.multiplexer_for(&task)?;
        self.validate(&task)?;
        self.persist(&task).await?;

        let result = if task.is_enabled() {
            mux.subscribe(task.clone()).await
        } else {
            mux.unsubscribe(&task.chain_id, &task.action).await
        };
        if let Err(e) = result {
            tracing::warn!(task = %task.key(), error = %e, "task persisted but not live");
        }

        let state = Self::live_state(&mux, &task).await;
        tracing::info!(task = %task.key(), state = %state, "task applied");
        Ok(state)
    }

    /// Persist and apply many tasks with a single rebuild per
    /// (multiplexer, chain). Tasks that fail validation are skipped.
    pub async fn apply_many(
        &self,
        tasks: Vec<SubscriptionTask>,
    ) -> Result<Vec<(TaskKey, TaskState)>, WatchError> {
        self.apply_grouped(tasks, true).await
    }

    async fn apply_grouped(
        &self,
        tasks: Vec<SubscriptionTask>,
        persist: bool,
    ) -> Result<Vec<(TaskKey, TaskState)>, WatchError> {
        let mut groups: Vec<TaskGroup> = vec![];

        for task in tasks {
            let mux = match self.multiplexer_for(&task).and_then(|mux| {
                self.validate(&task)?;
                Ok(mux)
            }) {
                Ok(mux) => mux,
                Err(e) => {
                    tracing::warn!(task = %task.key(), error = %e, "skipping task");
                    continue;
                }
            };
            if persist {
                self.persist(&task).await?;
            }
            match groups
                .iter_mut()
                .find(|g| Arc::ptr_eq(&g.mux, &mux) && g.chain_id == task.chain_id)
            {
                Some(group) => group.tasks.push(task),
                None => groups.push(TaskGroup {
                    mux,
                    chain_id: task.chain_id.clone(),
                    tasks: vec![task],
                }),
            }
        }

        let mut outcomes = vec![];
        for group in groups {
            let ops = group
                .tasks
                .iter()
                .map(|t| {
                    if t.is_enabled() {
                        BatchOp::Subscribe(t.clone())
                    } else {
                        BatchOp::Unsubscribe(t.action.clone())
                    }
                })
                .collect();
            if let Err(e) = group.mux.apply_batch(&group.chain_id, ops).await {
                tracing::warn!(
                    scope = %group.mux.scope(),
                    chain_id = %group.chain_id,
                    error = %e,
                    "batch persisted but not live"
                );
            }
            for task in &group.tasks {
                outcomes.push((task.key(), Self::live_state(&group.mux, task).await));
            }
        }
        Ok(outcomes)
    }

    /// Re-subscribe every persisted enabled task. Called once at startup,
    /// after accounts are loaded.
    pub async fn restore(&self) -> Result<usize, WatchError> {
        let mut enabled = vec![];
        for store in [CHAIN_TASKS, ACCOUNT_TASKS] {
            for value in self.store.get_all(store).await? {
                match serde_json::from_value::<SubscriptionTask>(value) {
                    Ok(task) if task.is_enabled() => enabled.push(task),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(store, error = %e, "skipping unreadable task record"),
                }
            }
        }
        let count = enabled.len();
        self.apply_grouped(enabled, false).await?;
        tracing::info!(tasks = count, "persisted tasks restored");
        Ok(count)
    }

    /// Parse a JSON array of tasks from a backup and apply the ones whose
    /// account exists and has the capability the action needs.
    pub async fn import_tasks(&self, serialized: &str) -> Result<Vec<(TaskKey, TaskState)>, WatchError> {
        let tasks: Vec<SubscriptionTask> = serde_json::from_str(serialized)?;
        let total = tasks.len();
        let accepted: Vec<_> = tasks.into_iter().filter(|t| self.importable(t)).collect();
        tracing::info!(total, accepted = accepted.len(), "importing tasks");

        let outcomes = self.apply_many(accepted).await?;
        self.disconnect_if_unused().await;
        Ok(outcomes)
    }

    fn importable(&self, task: &SubscriptionTask) -> bool {
        let Some(account) = &task.account else {
            return true;
        };
        let Some(account) = self.accounts.get(&task.chain_id, &account.address) else {
            return false;
        };
        let record = account.record();
        match task.action.split(':').next() {
            Some("nominationPools") => record.nomination_pool.is_some(),
            Some("nominating") => record.nominating.is_some(),
            _ => true,
        }
    }

    // ─── Catalog views ───────────────────────────────────────────────────────

    /// The account's full task catalog with persisted-enabled statuses.
    pub fn merge_active(&self, account: &Account, persisted: &[SubscriptionTask]) -> Vec<SubscriptionTask> {
        merge_with_catalog(account_templates(&account.record()), persisted)
    }

    /// The chain's full task catalog with persisted-enabled statuses.
    pub fn merge_active_chain_tasks(&self, persisted: &[SubscriptionTask], chain_id: &str) -> Vec<SubscriptionTask> {
        merge_with_catalog(chain_templates(chain_id), persisted)
    }

    async fn persisted(&self, store: &str) -> Result<Vec<SubscriptionTask>, WatchError> {
        Ok(self
            .store
            .get_all(store)
            .await?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Catalog and status of every registered account.
    pub async fn get_all_account_subscriptions(&self) -> Result<Vec<AccountSubscriptions>, WatchError> {
        let persisted = self.persisted(ACCOUNT_TASKS).await?;
        Ok(self
            .accounts
            .all()
            .iter()
            .map(|account| {
                let record = account.record();
                let own: Vec<_> = persisted
                    .iter()
                    .filter(|t| {
                        t.chain_id == record.chain_id
                            && t.account.as_ref().map_or(false, |a| a.address == record.address)
                    })
                    .cloned()
                    .collect();
                AccountSubscriptions {
                    account: record.account_ref(),
                    tasks: self.merge_active(account, &own),
                }
            })
            .collect())
    }

    /// Catalog and status of chain tasks for every configured chain.
    pub async fn get_all_chain_subscriptions(&self) -> Result<BTreeMap<ChainId, Vec<SubscriptionTask>>, WatchError> {
        let persisted = self.persisted(CHAIN_TASKS).await?;
        Ok(self
            .connections
            .configured_chains()
            .into_iter()
            .map(|chain_id| {
                let tasks = self.merge_active_chain_tasks(&persisted, &chain_id);
                (chain_id, tasks)
            })
            .collect())
    }

    /// Lifecycle state of the task with identity `key`.
    pub async fn task_state(&self, key: &TaskKey) -> Result<TaskState, WatchError> {
        let store = match key {
            TaskKey::Chain { .. } => CHAIN_TASKS,
            TaskKey::Account { .. } => ACCOUNT_TASKS,
        };
        let Some(value) = self.store.get(store, &key.storage_key()).await? else {
            return Ok(TaskState::Disabled);
        };
        let task: SubscriptionTask = serde_json::from_value(value)?;
        match self.multiplexer_for(&task) {
            Ok(mux) => Ok(Self::live_state(&mux, &task).await),
            Err(_) if !task.is_enabled() => Ok(TaskState::Disabled),
            Err(_) => Ok(TaskState::PendingSubscribe),
        }
    }

    // ─── Connections ─────────────────────────────────────────────────────────

    async fn multiplexers_on(&self, chain_id: &str) -> Vec<Arc<Multiplexer>> {
        let mut muxes: Vec<_> = self
            .accounts
            .accounts_on(chain_id)
            .iter()
            .map(|a| Arc::clone(a.multiplexer()))
            .collect();
        muxes.push(Arc::clone(&self.chain_mux));

        let mut with_entries = vec![];
        for mux in muxes {
            if mux.has_entries(chain_id).await {
                with_entries.push(mux);
            }
        }
        with_entries
    }

    /// Rebuild every multiplexer with entries on `chain_id`. Returns the
    /// first failure after trying them all.
    pub async fn resync(&self, chain_id: &str) -> Result<(), WatchError> {
        let mut first_error = None;
        for mux in self.multiplexers_on(chain_id).await {
            if let Err(e) = mux.rebuild(chain_id).await {
                tracing::warn!(scope = %mux.scope(), chain_id, error = %e, "resync failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Retry every chain whose last connection attempt failed or whose
    /// transport dropped. Returns the chains that came back.
    pub async fn recover_failed(&self) -> Vec<ChainId> {
        let mut recovered = vec![];
        for chain_id in self.connections.failed_chains() {
            if self.resync(&chain_id).await.is_ok() && !self.connections.is_failed(&chain_id) {
                tracing::info!(chain_id = %chain_id, "chain recovered");
                recovered.push(chain_id);
            }
        }
        recovered
    }

    /// Point `chain_id` at a new RPC endpoint and bring its subscriptions
    /// back up on it.
    pub async fn on_endpoint_change(&self, chain_id: &str, endpoint: &str) -> Result<(), WatchError> {
        self.connections.switch_endpoint(chain_id, endpoint).await?;
        self.resync(chain_id).await
    }

    /// Close every connection nothing uses any more. Returns the closed
    /// chains.
    pub async fn disconnect_if_unused(&self) -> Vec<ChainId> {
        let mut closed = vec![];
        for chain_id in self.connections.chains() {
            if self.accounts.has_enabled_subscriptions(&chain_id).await
                || self.chain_mux.has_entries(&chain_id).await
                || self.api_usage.requires_connection(&chain_id)
            {
                continue;
            }
            if let Some(conn) = self.connections.get(&chain_id) {
                if !conn.is_connected() && !conn.is_dropped() {
                    continue;
                }
            }
            self.connections.close(&chain_id).await;
            tracing::info!(chain_id = %chain_id, "closed unused connection");
            closed.push(chain_id);
        }
        closed
    }

    // ─── Removal ─────────────────────────────────────────────────────────────

    /// Remove an account with all its task records, then close connections
    /// left unused.
    pub async fn remove_account(&self, chain_id: &str, address: &str) -> Result<(), WatchError> {
        if self.accounts.remove(chain_id, address).await?.is_none() {
            return Err(WatchError::UnknownAccount {
                chain_id: chain_id.to_string(),
                address: address.to_string(),
            });
        }
        for (key, value) in self.store.get_all_objects(ACCOUNT_TASKS).await? {
            let owned = serde_json::from_value::<SubscriptionTask>(value).map_or(false, |t| {
                t.chain_id == chain_id && t.account.map_or(false, |a| a.address == address)
            });
            if owned {
                self.store.delete(ACCOUNT_TASKS, &key).await?;
            }
        }
        self.disconnect_if_unused().await;
        Ok(())
    }

    /// Drop every chain-level task on `chain_id`, then close connections
    /// left unused.
    pub async fn remove_chain_tasks(&self, chain_id: &str) -> Result<(), WatchError> {
        let ops = self
            .chain_mux
            .tasks(chain_id)
            .await
            .into_iter()
            .map(|t| BatchOp::Unsubscribe(t.action))
            .collect();
        if let Err(e) = self.chain_mux.apply_batch(chain_id, ops).await {
            tracing::warn!(chain_id, error = %e, "failed to drop chain subscriptions");
        }
        for (key, value) in self.store.get_all_objects(CHAIN_TASKS).await? {
            if value.get("chainId").and_then(|c| c.as_str()) == Some(chain_id) {
                self.store.delete(CHAIN_TASKS, &key).await?;
            }
        }
        self.disconnect_if_unused().await;
        Ok(())
    }
}
