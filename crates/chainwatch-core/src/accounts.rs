//! Imported accounts, each owning a [`Multiplexer`] for its tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::catalog::QueryCatalog;
use crate::connection::ConnectionRegistry;
use crate::dispatcher::{Dispatcher, DisplayNames};
use crate::error::WatchError;
use crate::multiplexer::{Multiplexer, Scope};
use crate::store::{KeyValueStore, ACCOUNTS};
use crate::task::{AccountRef, ChainId};

/// Where the account's keys live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSource {
    Ledger,
    Vault,
    #[default]
    ReadOnly,
    WalletConnect,
}

/// Nomination pool the account is a member of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMembership {
    pub pool_id: u32,
    #[serde(default)]
    pub pool_stash: String,
    #[serde(default)]
    pub pool_reward_address: String,
}

/// Staking nominations made by the account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NominatingData {
    pub validators: Vec<String>,
    #[serde(default)]
    pub last_era: Option<u32>,
}

/// Persisted form of an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub address: String,
    pub chain_id: ChainId,
    pub name: String,
    #[serde(default)]
    pub source: AccountSource,
    #[serde(default)]
    pub nomination_pool: Option<PoolMembership>,
    #[serde(default)]
    pub nominating: Option<NominatingData>,
    /// Hex storage keys for this account's queries, keyed by action
    /// (`"nominationPools:rewards"`) or action family (`"balance"`).
    #[serde(default)]
    pub storage_keys: BTreeMap<String, String>,
}

impl AccountRecord {
    pub fn new(chain_id: impl Into<ChainId>, address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            chain_id: chain_id.into(),
            name: name.into(),
            source: AccountSource::default(),
            nomination_pool: None,
            nominating: None,
            storage_keys: BTreeMap::new(),
        }
    }

    pub fn with_pool(mut self, pool: PoolMembership) -> Self {
        self.nomination_pool = Some(pool);
        self
    }

    pub fn with_nominating(mut self, nominating: NominatingData) -> Self {
        self.nominating = Some(nominating);
        self
    }

    pub fn with_storage_key(mut self, action: impl Into<String>, key: impl Into<String>) -> Self {
        self.storage_keys.insert(action.into(), key.into());
        self
    }

    /// Storage key for `action`, by exact action first, then by family.
    pub fn storage_key_for(&self, action: &str) -> Option<&str> {
        self.storage_keys
            .get(action)
            .or_else(|| {
                let family = action.split(':').next().unwrap_or(action);
                self.storage_keys.get(family)
            })
            .map(String::as_str)
    }

    pub fn account_ref(&self) -> AccountRef {
        AccountRef {
            address: self.address.clone(),
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
        }
    }

    fn store_key(&self) -> String {
        store_key(&self.chain_id, &self.address)
    }
}

fn store_key(chain_id: &str, address: &str) -> String {
    format!("{chain_id}:{address}")
}

// ─── Account ─────────────────────────────────────────────────────────────────

pub struct Account {
    record: Mutex<AccountRecord>,
    multiplexer: Arc<Multiplexer>,
}

impl Account {
    pub fn record(&self) -> AccountRecord {
        self.record.lock().unwrap().clone()
    }

    pub fn address(&self) -> String {
        self.record.lock().unwrap().address.clone()
    }

    pub fn chain_id(&self) -> ChainId {
        self.record.lock().unwrap().chain_id.clone()
    }

    pub fn name(&self) -> String {
        self.record.lock().unwrap().name.clone()
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account").field("record", &self.record()).finish()
    }
}

// ─── AccountRegistry ─────────────────────────────────────────────────────────

pub struct AccountRegistry {
    store: Arc<dyn KeyValueStore>,
    connections: Arc<ConnectionRegistry>,
    catalog: Arc<dyn QueryCatalog>,
    dispatcher: Arc<Dispatcher>,
    accounts: Mutex<BTreeMap<(ChainId, String), Arc<Account>>>,
}

impl AccountRegistry {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        connections: Arc<ConnectionRegistry>,
        catalog: Arc<dyn QueryCatalog>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            connections,
            catalog,
            dispatcher,
            accounts: Mutex::new(BTreeMap::new()),
        }
    }

    fn names(&self) -> &DisplayNames {
        self.dispatcher.names()
    }

    fn insert(&self, record: AccountRecord) -> Arc<Account> {
        let key = (record.chain_id.clone(), record.address.clone());
        let mut accounts = self.accounts.lock().unwrap();
        if let Some(existing) = accounts.get(&key) {
            *existing.record.lock().unwrap() = record;
            return Arc::clone(existing);
        }

        let multiplexer = Arc::new(Multiplexer::new(
            Scope::Account {
                chain_id: record.chain_id.clone(),
                address: record.address.clone(),
            },
            Arc::clone(&self.connections),
            Arc::clone(&self.catalog),
            Arc::clone(&self.dispatcher),
        ));
        self.names().set(&record.chain_id, &record.address, &record.name);
        let account = Arc::new(Account {
            record: Mutex::new(record),
            multiplexer,
        });
        accounts.insert(key, Arc::clone(&account));
        account
    }

    /// Register and persist an account. Re-adding an existing account
    /// replaces its metadata and keeps its subscriptions.
    pub async fn add(&self, record: AccountRecord) -> Result<Arc<Account>, WatchError> {
        self.store
            .set(ACCOUNTS, &record.store_key(), serde_json::to_value(&record)?)
            .await?;
        tracing::info!(chain_id = %record.chain_id, address = %record.address, "account added");
        Ok(self.insert(record))
    }

    /// Tear down the account's multiplexer, then forget the account.
    /// Task records and the idle-connection sweep are left to
    /// [`TaskOrchestrator::remove_account`](crate::TaskOrchestrator::remove_account),
    /// the public way to remove an account.
    pub(crate) async fn remove(&self, chain_id: &str, address: &str) -> Result<Option<Arc<Account>>, WatchError> {
        let Some(account) = self.get(chain_id, address) else {
            return Ok(None);
        };
        account.multiplexer.teardown().await;

        self.accounts
            .lock()
            .unwrap()
            .remove(&(chain_id.to_string(), address.to_string()));
        self.names().remove(chain_id, address);
        self.store.delete(ACCOUNTS, &store_key(chain_id, address)).await?;
        tracing::info!(chain_id, address, "account removed");
        Ok(Some(account))
    }

    /// Change the display name used in rendered events.
    pub async fn rename(&self, chain_id: &str, address: &str, name: &str) -> Result<(), WatchError> {
        let account = self
            .get(chain_id, address)
            .ok_or_else(|| WatchError::UnknownAccount {
                chain_id: chain_id.to_string(),
                address: address.to_string(),
            })?;
        let record = {
            let mut record = account.record.lock().unwrap();
            record.name = name.to_string();
            record.clone()
        };
        self.names().set(chain_id, address, name);
        self.store
            .set(ACCOUNTS, &record.store_key(), serde_json::to_value(&record)?)
            .await
    }

    pub fn get(&self, chain_id: &str, address: &str) -> Option<Arc<Account>> {
        self.accounts
            .lock()
            .unwrap()
            .get(&(chain_id.to_string(), address.to_string()))
            .cloned()
    }

    pub fn accounts_on(&self, chain_id: &str) -> Vec<Arc<Account>> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| c == chain_id)
            .map(|(_, a)| Arc::clone(a))
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Account>> {
        self.accounts.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if any account on `chain_id` has at least one live
    /// or pending entry.
    pub async fn has_enabled_subscriptions(&self, chain_id: &str) -> bool {
        for account in self.accounts_on(chain_id) {
            if account.multiplexer.has_entries(chain_id).await {
                return true;
            }
        }
        false
    }

    /// Rehydrate accounts from the store. Unreadable records are skipped.
    pub async fn load(&self) -> Result<usize, WatchError> {
        let mut loaded = 0;
        for value in self.store.get_all(ACCOUNTS).await? {
            match serde_json::from_value::<AccountRecord>(value) {
                Ok(record) => {
                    self.insert(record);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable account record"),
            }
        }
        tracing::debug!(loaded, "accounts loaded");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{PassthroughQuery, StaticCatalog};
    use crate::config::ChainConfig;
    use crate::memory::MemoryClientFactory;
    use crate::store::MemoryStore;
    use crate::task::{SubscriptionTask, TaskStatus};

    const CHAIN: &str = "Polkadot Relay";
    const ADDR: &str = "14E5nqKAp3oAJcmzgZhUD2RcptBeUBScxKHgJKU4HPNcKVf3";

    fn registry(store: Arc<MemoryStore>) -> (Arc<MemoryClientFactory>, AccountRegistry) {
        let factory = Arc::new(MemoryClientFactory::new());
        let connections = Arc::new(ConnectionRegistry::new(
            factory.clone(),
            &[ChainConfig::new(CHAIN, "wss://rpc.polkadot.io")],
        ));
        let mut catalog = StaticCatalog::new();
        catalog.register(Arc::new(PassthroughQuery::new("balance:free")));
        let dispatcher = Arc::new(Dispatcher::new(8, DisplayNames::new()));
        let registry = AccountRegistry::new(store, connections, Arc::new(catalog), dispatcher);
        (factory, registry)
    }

    #[tokio::test]
    async fn add_persists_and_load_restores() {
        let store = Arc::new(MemoryStore::new());
        let (_, first) = registry(store.clone());
        first.add(AccountRecord::new(CHAIN, ADDR, "Treasury")).await.unwrap();
        assert_eq!(store.len(ACCOUNTS), 1);

        let (_, second) = registry(store);
        assert_eq!(second.load().await.unwrap(), 1);
        assert_eq!(second.get(CHAIN, ADDR).unwrap().name(), "Treasury");
        assert_eq!(second.names().get(CHAIN, ADDR).as_deref(), Some("Treasury"));
    }

    #[tokio::test]
    async fn rename_updates_names_and_store() {
        let store = Arc::new(MemoryStore::new());
        let (_, reg) = registry(store.clone());
        reg.add(AccountRecord::new(CHAIN, ADDR, "Treasury")).await.unwrap();
        reg.rename(CHAIN, ADDR, "Ops").await.unwrap();

        assert_eq!(reg.names().get(CHAIN, ADDR).as_deref(), Some("Ops"));
        let stored = store.get(ACCOUNTS, &store_key(CHAIN, ADDR)).await.unwrap().unwrap();
        assert_eq!(stored["name"], "Ops");

        let err = reg.rename(CHAIN, "nobody", "x").await.unwrap_err();
        assert!(matches!(err, WatchError::UnknownAccount { .. }));
    }

    #[tokio::test]
    async fn remove_tears_down_subscriptions() {
        let store = Arc::new(MemoryStore::new());
        let (factory, reg) = registry(store.clone());
        let account = reg.add(AccountRecord::new(CHAIN, ADDR, "Treasury")).await.unwrap();
        let task = SubscriptionTask::account(account.record().account_ref(), "balance:free", "Free")
            .with_status(TaskStatus::Enable);
        account.multiplexer().subscribe(task).await.unwrap();
        assert!(reg.has_enabled_subscriptions(CHAIN).await);

        reg.remove(CHAIN, ADDR).await.unwrap();
        assert!(reg.get(CHAIN, ADDR).is_none());
        assert!(!reg.has_enabled_subscriptions(CHAIN).await);
        assert_eq!(factory.client(CHAIN).live_count(), 0);
        assert!(store.is_empty(ACCOUNTS));
    }

    #[test]
    fn storage_key_falls_back_to_family() {
        let record = AccountRecord::new(CHAIN, ADDR, "Treasury")
            .with_storage_key("balance", "0xaa")
            .with_storage_key("nominationPools:rewards", "0xbb");
        assert_eq!(record.storage_key_for("balance:free"), Some("0xaa"));
        assert_eq!(record.storage_key_for("nominationPools:rewards"), Some("0xbb"));
        assert_eq!(record.storage_key_for("nominationPools:state"), None);
    }

    #[test]
    fn record_deserializes_with_defaults() {
        let record: AccountRecord = serde_json::from_str(
            r#"{"address":"1abc","chainId":"Kusama Relay","name":"Cold","source":"wallet-connect"}"#,
        )
        .unwrap();
        assert_eq!(record.source, AccountSource::WalletConnect);
        assert!(record.nomination_pool.is_none());
        assert!(record.storage_keys.is_empty());
    }
}
