//! chainwatch-core — subscription multiplexing and connection lifecycle.
//!
//! # Overview
//!
//! ChainWatch watches chain state for a set of accounts and emits an event
//! whenever a watched value changes. The core crate defines:
//!
//! - [`Multiplexer`] — one physical subscription per chain per scope,
//!   carrying every logical subscription, with per-entry deduplication
//! - [`ConnectionRegistry`] — at most one [`Connection`] per chain
//! - [`TaskOrchestrator`] — persists task changes and routes them to the
//!   owning multiplexer; closes connections nothing uses
//! - [`AccountRegistry`] — imported accounts, each with its own multiplexer
//! - [`Dispatcher`] — renders events and fans them out to the UI channel,
//!   the event log and OS notifications
//! - [`TaskIntake`] — single-consumer command queue in front of the
//!   orchestrator
//! - [`ChainClient`] / [`QueryCatalog`] / [`KeyValueStore`] — the seams to
//!   the chain, the query definitions and persistence

pub mod accounts;
pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod intake;
pub mod memory;
pub mod multiplexer;
pub mod orchestrator;
pub mod store;
pub mod task;
pub mod tracing_setup;

pub use accounts::{Account, AccountRecord, AccountRegistry, AccountSource, NominatingData, PoolMembership};
pub use catalog::{ChainQuery, ChangePolicy, QueryCatalog, StaticCatalog};
pub use client::{ChainClient, ClientFactory, PhysicalSubscription, QueryCall, SubscriptionId};
pub use config::{ChainConfig, WatchConfig};
pub use connection::{Connection, ConnectionRegistry, ConnectionStatus};
pub use dispatcher::{
    prune_events, ChainEvent, Dispatcher, DisplayNames, EventLog, EventOrigin, NotificationSink,
    StoreEventLog,
};
pub use engine::{Engine, EngineBuilder};
pub use error::WatchError;
pub use intake::{IntakeHandle, TaskIntake};
pub use multiplexer::{BatchOp, Multiplexer, MultiplexStats, Scope};
pub use orchestrator::{AccountSubscriptions, ApiUsage, NoApiUsage, TaskOrchestrator};
pub use store::{KeyValueStore, MemoryStore};
pub use task::{AccountRef, ChainId, SubscriptionTask, TaskKey, TaskState, TaskStatus};
pub use tracing_setup::{init_tracing, LogConfig};
