//! Error types for the subscription engine.

use thiserror::Error;

/// Errors that can occur while managing subscriptions and connections.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The task action has no registered query for this chain.
    #[error("Action '{action}' not found for chain {chain_id}")]
    ActionNotFound { chain_id: String, action: String },

    /// Opening or reopening the chain's connection failed.
    #[error("Connection to {chain_id} failed: {reason}")]
    ConnectionFailure { chain_id: String, reason: String },

    /// The physical multiplexed subscription could not be (re)established.
    #[error("Rebuild of subscription for {chain_id} failed: {reason}")]
    RebuildFailure { chain_id: String, reason: String },

    /// The key/value store rejected a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// No endpoint is configured for the chain.
    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    /// The account is not registered.
    #[error("Unknown account {address} on {chain_id}")]
    UnknownAccount { chain_id: String, address: String },

    /// A streamed value could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Wire-level failure reported by the chain client.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The intake loop or another internal task has shut down.
    #[error("{0}")]
    Other(String),
}

impl WatchError {
    /// Returns `true` if the failure is transient and a later retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailure { .. } | Self::RebuildFailure { .. } | Self::Transport(_)
        )
    }

    pub(crate) fn rebuild(chain_id: &str, cause: impl std::fmt::Display) -> Self {
        Self::RebuildFailure {
            chain_id: chain_id.to_string(),
            reason: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let conn = WatchError::ConnectionFailure {
            chain_id: "Polkadot Relay".into(),
            reason: "refused".into(),
        };
        assert!(conn.is_retryable());
        assert!(WatchError::rebuild("Kusama Relay", "closed").is_retryable());

        let missing = WatchError::ActionNotFound {
            chain_id: "Polkadot Relay".into(),
            action: "balance:nope".into(),
        };
        assert!(!missing.is_retryable());
        assert!(!WatchError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn display_names_chain_and_action() {
        let err = WatchError::ActionNotFound {
            chain_id: "Westend Relay".into(),
            action: "balance:free".into(),
        };
        assert_eq!(
            err.to_string(),
            "Action 'balance:free' not found for chain Westend Relay"
        );
    }
}
