//! JSON-RPC 2.0 wire types for the Substrate node API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id as sent by the server; the client only issues numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The result value, or the node's error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Payload of a `state_storage` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageChangeSet {
    pub block: String,
    /// `(key, value)` pairs; `None` means the storage item was removed.
    pub changes: Vec<(String, Option<String>)>,
}

/// Method name of storage subscription notifications.
pub const STORAGE_NOTIFICATION: &str = "state_storage";

#[derive(Deserialize)]
struct NotificationParams {
    subscription: Value,
    result: StorageChangeSet,
}

/// A frame read from the node.
#[derive(Debug)]
pub enum Incoming {
    Response(JsonRpcResponse),
    StorageChange {
        subscription: String,
        changes: StorageChangeSet,
    },
    /// Notifications for other methods.
    Ignored,
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let mut frame: Value = serde_json::from_str(text)?;
        match frame.get("method").and_then(Value::as_str) {
            Some(STORAGE_NOTIFICATION) => {
                let params: NotificationParams = serde_json::from_value(frame["params"].take())?;
                match subscription_id(&params.subscription) {
                    Some(subscription) => Ok(Self::StorageChange {
                        subscription,
                        changes: params.result,
                    }),
                    None => Ok(Self::Ignored),
                }
            }
            Some(_) => Ok(Self::Ignored),
            None => Ok(Self::Response(serde_json::from_value(frame)?)),
        }
    }
}

/// Subscription ids are strings on current nodes and numbers on old ones.
pub fn subscription_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
