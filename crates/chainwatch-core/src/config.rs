//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::accounts::AccountRecord;
use crate::catalog::DEFAULT_TIMESTAMP_TOLERANCE_MS;
use crate::error::WatchError;
use crate::task::{ChainId, SubscriptionTask};
use crate::tracing_setup::LogConfig;

/// RPC endpoints for one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: ChainId,
    /// WebSocket endpoints, e.g. `"wss://rpc.polkadot.io"`.
    pub endpoints: Vec<String>,
    /// Index into `endpoints` of the endpoint to use.
    #[serde(default)]
    pub selected: usize,
}

impl ChainConfig {
    pub fn new(chain_id: impl Into<ChainId>, endpoint: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            endpoints: vec![endpoint.into()],
            selected: 0,
        }
    }

    /// The selected endpoint, falling back to the first one.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoints
            .get(self.selected)
            .or_else(|| self.endpoints.first())
            .map(String::as_str)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub log: LogConfig,
    /// Capacity of the UI event broadcast channel.
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Jitter buffer for the `chain:timestamp` query, in milliseconds.
    #[serde(default = "default_timestamp_tolerance")]
    pub timestamp_tolerance_ms: u64,
    /// SQLite database path; `None` keeps state in memory.
    #[serde(default)]
    pub store_path: Option<String>,
    /// Age after which logged events are pruned; `None` keeps them forever.
    #[serde(default = "default_event_retention")]
    pub event_retention_secs: Option<u64>,
    /// Interval of the recovery and pruning sweep run by long-lived hosts.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    /// Accounts to register at startup.
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    /// Tasks to apply at startup, after persisted ones are restored.
    #[serde(default)]
    pub tasks: Vec<SubscriptionTask>,
}

fn default_channel_capacity() -> usize { 1_024 }
fn default_timestamp_tolerance() -> u64 { DEFAULT_TIMESTAMP_TOLERANCE_MS }
fn default_event_retention() -> Option<u64> { Some(30 * 24 * 60 * 60) }
fn default_maintenance_interval() -> u64 { 30 }

impl WatchConfig {
    /// Create a simple config for a single chain.
    pub fn single_chain(chain: impl Into<ChainId>, rpc_url: impl Into<String>) -> Self {
        Self {
            chains: vec![ChainConfig::new(chain, rpc_url)],
            log: LogConfig::default(),
            event_channel_capacity: default_channel_capacity(),
            timestamp_tolerance_ms: default_timestamp_tolerance(),
            store_path: None,
            event_retention_secs: default_event_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
            accounts: vec![],
            tasks: vec![],
        }
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| WatchError::Other(format!("reading {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let json = r#"{
            "chains": [
                { "chainId": "Polkadot Relay",
                  "endpoints": ["wss://rpc.polkadot.io", "wss://polkadot-rpc.dwellir.com"],
                  "selected": 1 }
            ]
        }"#;
        let config: WatchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.event_channel_capacity, 1_024);
        assert_eq!(config.timestamp_tolerance_ms, DEFAULT_TIMESTAMP_TOLERANCE_MS);
        assert_eq!(config.log, LogConfig::default());
        assert_eq!(config.event_retention_secs, Some(2_592_000));
        assert_eq!(config.maintenance_interval_secs, 30);
        assert_eq!(
            config.chain("Polkadot Relay").unwrap().endpoint(),
            Some("wss://polkadot-rpc.dwellir.com")
        );
    }

    #[test]
    fn out_of_range_selection_falls_back_to_first() {
        let mut chain = ChainConfig::new("Kusama Relay", "wss://kusama-rpc.polkadot.io");
        chain.selected = 7;
        assert_eq!(chain.endpoint(), Some("wss://kusama-rpc.polkadot.io"));
    }
}
