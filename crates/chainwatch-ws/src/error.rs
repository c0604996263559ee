//! WebSocket client errors.

use thiserror::Error;

use chainwatch_core::WatchError;

use crate::rpc::JsonRpcError;

/// Errors from the WebSocket chain client.
#[derive(Debug, Error)]
pub enum WsError {
    /// Connection, send or receive failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Error object returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl WsError {
    /// Returns `true` if this error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout { .. } | Self::NotConnected)
    }
}

impl From<WsError> for WatchError {
    fn from(e: WsError) -> Self {
        WatchError::Transport(e.to_string())
    }
}
