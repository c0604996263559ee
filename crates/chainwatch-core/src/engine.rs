//! Engine wiring: one owned instance of every registry, built from a
//! [`WatchConfig`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainwatch_core::{Engine, WatchConfig};
//! use chainwatch_core::memory::MemoryClientFactory;
//!
//! # async fn run() -> Result<(), chainwatch_core::WatchError> {
//! let engine = Engine::builder(WatchConfig::single_chain("Polkadot Relay", "wss://rpc.polkadot.io"))
//!     .client_factory(Arc::new(MemoryClientFactory::new()))
//!     .build()?;
//! engine.start().await?;
//! let (intake, _loop) = engine.intake();
//! intake.disconnect_if_unused().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::accounts::AccountRegistry;
use crate::catalog::{QueryCatalog, StaticCatalog};
use crate::client::ClientFactory;
use crate::config::WatchConfig;
use crate::connection::ConnectionRegistry;
use crate::dispatcher::{prune_events, ChainEvent, Dispatcher, DisplayNames, NotificationSink, StoreEventLog};
use crate::error::WatchError;
use crate::intake::{IntakeHandle, TaskIntake};
use crate::multiplexer::{Multiplexer, Scope};
use crate::orchestrator::{ApiUsage, TaskOrchestrator};
use crate::store::{KeyValueStore, MemoryStore};
use crate::task::ChainId;

/// Fluent builder for [`Engine`].
pub struct EngineBuilder {
    config: WatchConfig,
    factory: Option<Arc<dyn ClientFactory>>,
    store: Option<Arc<dyn KeyValueStore>>,
    catalog: Option<Arc<dyn QueryCatalog>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    api_usage: Option<Arc<dyn ApiUsage>>,
    event_log: bool,
}

impl EngineBuilder {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            config,
            factory: None,
            store: None,
            catalog: None,
            notifier: None,
            api_usage: None,
            event_log: true,
        }
    }

    /// Set how chain clients are created. Required.
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the persistent store (default: in-memory).
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the query catalog (default: the built-in catalog).
    pub fn catalog(mut self, catalog: Arc<dyn QueryCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn api_usage(mut self, api_usage: Arc<dyn ApiUsage>) -> Self {
        self.api_usage = Some(api_usage);
        self
    }

    /// Do not write dispatched events to the store.
    pub fn without_event_log(mut self) -> Self {
        self.event_log = false;
        self
    }

    pub fn build(self) -> Result<Engine, WatchError> {
        let factory = self
            .factory
            .ok_or_else(|| WatchError::Other("no client factory configured".into()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let catalog = self.catalog.unwrap_or_else(|| {
            Arc::new(StaticCatalog::builtin(self.config.timestamp_tolerance_ms)) as Arc<dyn QueryCatalog>
        });

        let mut dispatcher = Dispatcher::new(self.config.event_channel_capacity, DisplayNames::new());
        if self.event_log {
            dispatcher = dispatcher.with_event_log(Arc::new(StoreEventLog::new(Arc::clone(&store))));
        }
        if let Some(notifier) = self.notifier {
            dispatcher = dispatcher.with_notifier(notifier);
        }
        let dispatcher = Arc::new(dispatcher);

        let connections = Arc::new(ConnectionRegistry::new(factory, &self.config.chains));
        let accounts = Arc::new(AccountRegistry::new(
            Arc::clone(&store),
            Arc::clone(&connections),
            Arc::clone(&catalog),
            Arc::clone(&dispatcher),
        ));
        let chain_mux = Arc::new(Multiplexer::new(
            Scope::Chain,
            Arc::clone(&connections),
            Arc::clone(&catalog),
            Arc::clone(&dispatcher),
        ));
        let mut orchestrator = TaskOrchestrator::new(
            Arc::clone(&store),
            catalog,
            Arc::clone(&connections),
            Arc::clone(&accounts),
            chain_mux,
        );
        if let Some(api_usage) = self.api_usage {
            orchestrator = orchestrator.with_api_usage(api_usage);
        }

        Ok(Engine {
            config: self.config,
            store,
            connections,
            dispatcher,
            accounts,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

/// A running set of registries.
pub struct Engine {
    config: WatchConfig,
    store: Arc<dyn KeyValueStore>,
    connections: Arc<ConnectionRegistry>,
    dispatcher: Arc<Dispatcher>,
    accounts: Arc<AccountRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl Engine {
    pub fn builder(config: WatchConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        &self.accounts
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Subscribe to dispatched events.
    pub fn events(&self) -> broadcast::Receiver<ChainEvent> {
        self.dispatcher.subscribe()
    }

    /// Load persisted accounts, register configured ones, restore persisted
    /// tasks and apply the configured tasks.
    pub async fn start(&self) -> Result<(), WatchError> {
        let loaded = self.accounts.load().await?;
        for record in &self.config.accounts {
            self.accounts.add(record.clone()).await?;
        }
        let restored = self.orchestrator.restore().await?;
        if !self.config.tasks.is_empty() {
            self.orchestrator.apply_many(self.config.tasks.clone()).await?;
        }
        tracing::info!(
            accounts = self.accounts.len(),
            loaded,
            restored,
            configured_tasks = self.config.tasks.len(),
            "engine started"
        );
        Ok(())
    }

    /// Delete logged events older than the configured retention. Returns
    /// the number deleted.
    pub async fn prune_events(&self) -> Result<usize, WatchError> {
        let Some(retention) = self.config.event_retention_secs else {
            return Ok(0);
        };
        let cutoff = chrono::Utc::now().timestamp() - retention as i64;
        prune_events(self.store.as_ref(), cutoff).await
    }

    /// One pass of upkeep for long-lived hosts: bring failed or dropped
    /// chains back and prune the event log. Returns the recovered chains.
    pub async fn maintain(&self) -> Vec<ChainId> {
        let recovered = self.orchestrator.recover_failed().await;
        if let Err(e) = self.prune_events().await {
            tracing::warn!(error = %e, "event log pruning failed");
        }
        recovered
    }

    /// Start a task intake loop bound to this engine.
    pub fn intake(&self) -> (IntakeHandle, JoinHandle<()>) {
        TaskIntake::spawn(Arc::clone(&self.orchestrator))
    }

    /// Drop every physical subscription and close all connections.
    /// Persisted task statuses are kept.
    pub async fn shutdown(&self) {
        for account in self.accounts.all() {
            account.multiplexer().teardown().await;
        }
        self.orchestrator.chain_multiplexer().teardown().await;
        self.connections.close_all().await;
        tracing::info!("engine stopped");
    }
}
