//! The opaque chain client surface consumed by connections and multiplexers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::WatchError;

/// Identifier of a physical subscription, as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One slot of a multiplexed subscription: the storage key streamed for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryCall {
    /// Hex-encoded storage key (`0x…`).
    pub key: String,
}

impl QueryCall {
    pub fn storage(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A live physical subscription.
///
/// Every item on `ticks` carries exactly one raw value per [`QueryCall`] the
/// subscription was opened with, in the same order. Slots whose storage is
/// empty or not yet known are `Value::Null`.
pub struct PhysicalSubscription {
    pub id: SubscriptionId,
    pub ticks: mpsc::UnboundedReceiver<Vec<Value>>,
}

/// Connection-level client for one chain.
///
/// The wire protocol is owned by the implementation; the engine only needs
/// connect/disconnect, plain calls, and a multiplexed subscribe.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Open the connection to `endpoint`. Must fail rather than retry forever.
    async fn connect(&self, endpoint: &str) -> Result<(), WatchError>;

    /// Close the connection. Open subscriptions end.
    async fn disconnect(&self);

    /// Returns `true` while the underlying transport is open.
    fn is_connected(&self) -> bool;

    /// Send a single request and return its result.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, WatchError>;

    /// Open one physical subscription streaming all `calls` together.
    async fn subscribe(&self, calls: Vec<QueryCall>) -> Result<PhysicalSubscription, WatchError>;

    /// Close a physical subscription previously returned by `subscribe`.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), WatchError>;
}

/// Builds the client for a chain when its connection is first created.
pub trait ClientFactory: Send + Sync {
    fn create(&self, chain_id: &str) -> Arc<dyn ChainClient>;
}
