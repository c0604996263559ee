//! Per-chain connections and the registry that owns them.
//!
//! The registry holds at most one [`Connection`] per chain. Multiplexers
//! share it by `Arc`; only the registry opens, closes or re-points it.
//! Closing is the caller's decision: the registry does no ref-counting and
//! trusts the "safe to close" sweep in the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::client::{ChainClient, ClientFactory};
use crate::config::ChainConfig;
use crate::error::WatchError;
use crate::task::ChainId;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// One streaming connection to one chain.
pub struct Connection {
    chain_id: ChainId,
    endpoint: Mutex<String>,
    status: Mutex<ConnectionStatus>,
    client: Arc<dyn ChainClient>,
    /// Serializes connect/disconnect on this chain.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Connection {
    fn new(chain_id: ChainId, endpoint: String, client: Arc<dyn ChainClient>) -> Self {
        Self {
            chain_id,
            endpoint: Mutex::new(endpoint),
            status: Mutex::new(ConnectionStatus::Disconnected),
            client,
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// The currently selected endpoint.
    pub fn endpoint(&self) -> String {
        self.endpoint.lock().unwrap().clone()
    }

    /// Current status. A transport that dropped on its own reads as
    /// disconnected.
    pub fn status(&self) -> ConnectionStatus {
        let status = *self.status.lock().unwrap();
        if status == ConnectionStatus::Connected && !self.client.is_connected() {
            return ConnectionStatus::Disconnected;
        }
        status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Connected at last check, but the transport has since closed.
    pub fn is_dropped(&self) -> bool {
        *self.status.lock().unwrap() == ConnectionStatus::Connected && !self.client.is_connected()
    }

    /// The underlying client.
    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().unwrap() = status;
    }

    async fn connect(&self) -> Result<(), WatchError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = self.endpoint();
        self.set_status(ConnectionStatus::Connecting);
        tracing::info!(chain_id = %self.chain_id, endpoint = %endpoint, "connecting");

        match self.client.connect(&endpoint).await {
            Ok(()) => {
                self.set_status(ConnectionStatus::Connected);
                tracing::info!(chain_id = %self.chain_id, "connected");
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Disconnected);
                Err(WatchError::ConnectionFailure {
                    chain_id: self.chain_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.client.disconnect().await;
        self.set_status(ConnectionStatus::Disconnected);
        tracing::info!(chain_id = %self.chain_id, "disconnected");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("chain_id", &self.chain_id)
            .field("endpoint", &self.endpoint())
            .field("status", &self.status())
            .finish()
    }
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// Owns one [`Connection`] per chain and the set of chains whose last
/// connection attempt failed.
pub struct ConnectionRegistry {
    factory: Arc<dyn ClientFactory>,
    /// Configured endpoint per chain.
    endpoints: Mutex<HashMap<ChainId, String>>,
    connections: Mutex<HashMap<ChainId, Arc<Connection>>>,
    failed: Mutex<BTreeSet<ChainId>>,
}

impl ConnectionRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, chains: &[ChainConfig]) -> Self {
        let endpoints = chains
            .iter()
            .filter_map(|c| c.endpoint().map(|e| (c.chain_id.clone(), e.to_string())))
            .collect();
        Self {
            factory,
            endpoints: Mutex::new(endpoints),
            connections: Mutex::new(HashMap::new()),
            failed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Configure (or replace) the endpoint used when the chain's connection
    /// is first created.
    pub fn configure(&self, chain_id: impl Into<ChainId>, endpoint: impl Into<String>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(chain_id.into(), endpoint.into());
    }

    pub fn get(&self, chain_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(chain_id).cloned()
    }

    /// Status of the chain's connection; `Disconnected` if none exists.
    pub fn status(&self, chain_id: &str) -> ConnectionStatus {
        self.get(chain_id)
            .map(|c| c.status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Endpoint the chain is (or will be) connected to.
    pub fn endpoint(&self, chain_id: &str) -> Option<String> {
        match self.get(chain_id) {
            Some(conn) => Some(conn.endpoint()),
            None => self.endpoints.lock().unwrap().get(chain_id).cloned(),
        }
    }

    /// Chains that currently have a connection object, sorted.
    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.connections.lock().unwrap().keys().cloned().collect();
        chains.sort();
        chains
    }

    /// Chains with a configured endpoint, sorted.
    pub fn configured_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.endpoints.lock().unwrap().keys().cloned().collect();
        chains.sort();
        chains
    }

    /// Chains whose last connection attempt failed or whose transport
    /// dropped since, sorted.
    pub fn failed_chains(&self) -> Vec<ChainId> {
        let mut failed = self.failed.lock().unwrap().clone();
        failed.extend(
            self.connections
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, conn)| conn.is_dropped())
                .map(|(chain_id, _)| chain_id.clone()),
        );
        failed.into_iter().collect()
    }

    pub fn is_failed(&self, chain_id: &str) -> bool {
        let recorded = self.failed.lock().unwrap().contains(chain_id);
        recorded || self.get(chain_id).map_or(false, |conn| conn.is_dropped())
    }

    /// Return the chain's connection, creating and connecting it if needed.
    pub async fn ensure_connected(&self, chain_id: &str) -> Result<Arc<Connection>, WatchError> {
        let conn = self.get_or_create(chain_id)?;
        match conn.connect().await {
            Ok(()) => {
                self.failed.lock().unwrap().remove(chain_id);
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(chain_id, error = %e, "connection attempt failed");
                self.failed.lock().unwrap().insert(chain_id.to_string());
                Err(e)
            }
        }
    }

    fn get_or_create(&self, chain_id: &str) -> Result<Arc<Connection>, WatchError> {
        let mut connections = self.connections.lock().unwrap();
        if let Some(conn) = connections.get(chain_id) {
            return Ok(Arc::clone(conn));
        }
        let endpoint = self
            .endpoints
            .lock()
            .unwrap()
            .get(chain_id)
            .cloned()
            .ok_or_else(|| WatchError::UnknownChain(chain_id.to_string()))?;
        let conn = Arc::new(Connection::new(
            chain_id.to_string(),
            endpoint,
            self.factory.create(chain_id),
        ));
        connections.insert(chain_id.to_string(), Arc::clone(&conn));
        tracing::debug!(chain_id, "connection created");
        Ok(conn)
    }

    /// Disconnect the chain. The caller must have verified that nothing on
    /// this chain still needs the connection.
    pub async fn close(&self, chain_id: &str) {
        if let Some(conn) = self.get(chain_id) {
            conn.disconnect().await;
        }
        self.failed.lock().unwrap().remove(chain_id);
    }

    /// Disconnect every chain (shutdown).
    pub async fn close_all(&self) {
        for chain_id in self.chains() {
            self.close(&chain_id).await;
        }
    }

    /// Re-point the chain at `endpoint`. An existing connection is
    /// disconnected and reopened on the new endpoint; the caller must then
    /// rebuild every multiplexer with entries on this chain.
    pub async fn switch_endpoint(&self, chain_id: &str, endpoint: &str) -> Result<(), WatchError> {
        self.configure(chain_id, endpoint);
        let Some(conn) = self.get(chain_id) else {
            return Ok(());
        };

        conn.disconnect().await;
        *conn.endpoint.lock().unwrap() = endpoint.to_string();
        tracing::info!(chain_id, endpoint, "endpoint switched");

        match conn.connect().await {
            Ok(()) => {
                self.failed.lock().unwrap().remove(chain_id);
                Ok(())
            }
            Err(e) => {
                self.failed.lock().unwrap().insert(chain_id.to_string());
                Err(e)
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClientFactory;

    fn registry() -> (Arc<MemoryClientFactory>, ConnectionRegistry) {
        let factory = Arc::new(MemoryClientFactory::new());
        let registry = ConnectionRegistry::new(
            factory.clone(),
            &[
                ChainConfig::new("Polkadot Relay", "wss://rpc.polkadot.io"),
                ChainConfig::new("Kusama Relay", "wss://kusama-rpc.polkadot.io"),
            ],
        );
        (factory, registry)
    }

    #[tokio::test]
    async fn one_connection_per_chain() {
        let (factory, registry) = registry();
        let a = registry.ensure_connected("Polkadot Relay").await.unwrap();
        let b = registry.ensure_connected("Polkadot Relay").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.client("Polkadot Relay").connect_count(), 1);
        assert_eq!(a.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected() {
        let (_, registry) = registry();
        let err = registry.ensure_connected("Nowhere").await.unwrap_err();
        assert!(matches!(err, WatchError::UnknownChain(_)));
        assert!(registry.get("Nowhere").is_none());
    }

    #[tokio::test]
    async fn failure_is_recorded_then_cleared() {
        let (factory, registry) = registry();
        factory.client("Kusama Relay").fail_next_connects(1);

        let err = registry.ensure_connected("Kusama Relay").await.unwrap_err();
        assert!(matches!(err, WatchError::ConnectionFailure { .. }));
        assert_eq!(registry.failed_chains(), vec!["Kusama Relay".to_string()]);
        assert_eq!(registry.status("Kusama Relay"), ConnectionStatus::Disconnected);

        registry.ensure_connected("Kusama Relay").await.unwrap();
        assert!(registry.failed_chains().is_empty());
    }

    #[tokio::test]
    async fn close_marks_disconnected_and_reconnect_reuses_object() {
        let (factory, registry) = registry();
        let first = registry.ensure_connected("Polkadot Relay").await.unwrap();
        registry.close("Polkadot Relay").await;
        assert_eq!(first.status(), ConnectionStatus::Disconnected);

        let second = registry.ensure_connected("Polkadot Relay").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.client("Polkadot Relay").connect_count(), 2);
    }

    #[tokio::test]
    async fn dropped_transport_reads_disconnected() {
        let (factory, registry) = registry();
        let conn = registry.ensure_connected("Polkadot Relay").await.unwrap();
        factory.client("Polkadot Relay").drop_connection();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(registry.is_failed("Polkadot Relay"));
        assert_eq!(registry.failed_chains(), vec!["Polkadot Relay".to_string()]);

        registry.ensure_connected("Polkadot Relay").await.unwrap();
        assert!(registry.failed_chains().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_is_not_failed() {
        let (_, registry) = registry();
        registry.ensure_connected("Polkadot Relay").await.unwrap();
        registry.close("Polkadot Relay").await;
        assert!(!registry.is_failed("Polkadot Relay"));
        assert!(registry.failed_chains().is_empty());
    }

    #[tokio::test]
    async fn switch_endpoint_reconnects_on_new_endpoint() {
        let (factory, registry) = registry();
        registry.ensure_connected("Polkadot Relay").await.unwrap();
        registry
            .switch_endpoint("Polkadot Relay", "wss://polkadot-rpc.dwellir.com")
            .await
            .unwrap();

        let conn = registry.get("Polkadot Relay").unwrap();
        assert_eq!(conn.endpoint(), "wss://polkadot-rpc.dwellir.com");
        assert!(conn.is_connected());
        let client = factory.client("Polkadot Relay");
        assert_eq!(client.connect_count(), 2);
        assert_eq!(client.endpoint().as_deref(), Some("wss://polkadot-rpc.dwellir.com"));
    }

    #[tokio::test]
    async fn switch_without_connection_only_updates_config() {
        let (factory, registry) = registry();
        registry
            .switch_endpoint("Kusama Relay", "wss://kusama.dotters.network")
            .await
            .unwrap();
        assert!(registry.get("Kusama Relay").is_none());

        registry.ensure_connected("Kusama Relay").await.unwrap();
        assert_eq!(
            factory.client("Kusama Relay").endpoint().as_deref(),
            Some("wss://kusama.dotters.network")
        );
    }
}
