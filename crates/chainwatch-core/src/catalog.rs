//! Chain query catalog — resolves a task action to a callable + decoder.
//!
//! A [`ChainQuery`] turns a task into the [`QueryCall`] slot it occupies in a
//! multiplexed subscription and decodes the raw value streamed for that slot.
//! [`StaticCatalog`] is a registry of queries keyed by action, with a set of
//! built-in Substrate storage queries.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::client::QueryCall;
use crate::error::WatchError;
use crate::task::{ChainId, SubscriptionTask};

/// Storage key of `Timestamp::Now`.
pub const TIMESTAMP_NOW_KEY: &str =
    "0xf0c365c3cf59d671eb72da0e7a4113c49f1f0515f462cdcf84e0f1d6045dfcbb";
/// Storage key of `Babe::CurrentSlot`.
pub const CURRENT_SLOT_KEY: &str =
    "0x1cb6f36e027abb2091cfb5110ab5087f06155b3cd9a8c9e5e9a23fd5dc13a5ed";

/// Default jitter buffer for `chain:timestamp`, in milliseconds.
pub const DEFAULT_TIMESTAMP_TOLERANCE_MS: u64 = 1_000;

/// How a new value is compared against the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePolicy {
    /// Any change in content hash is a change.
    Exact,
    /// The value is numeric and must exceed the previous one by at least
    /// the given amount to count as a change.
    MonotonicWithTolerance(u64),
}

/// A resolved chain-state query.
pub trait ChainQuery: Send + Sync {
    /// The action identifier this query serves.
    fn action(&self) -> &str;

    /// The subscription slot for `task`.
    fn call(&self, task: &SubscriptionTask) -> Result<QueryCall, WatchError>;

    /// Decode a raw streamed value.
    fn decode(&self, raw: &Value) -> Result<Value, WatchError>;

    fn change_policy(&self) -> ChangePolicy {
        ChangePolicy::Exact
    }
}

/// Resolves `(chain, action)` to a query.
pub trait QueryCatalog: Send + Sync {
    fn resolve(&self, chain_id: &str, action: &str) -> Result<Arc<dyn ChainQuery>, WatchError>;
}

// ─── StaticCatalog ───────────────────────────────────────────────────────────

struct Registered {
    query: Arc<dyn ChainQuery>,
    /// `None` = available on every chain.
    chains: Option<HashSet<ChainId>>,
}

/// In-process catalog of queries keyed by action.
#[derive(Default)]
pub struct StaticCatalog {
    queries: BTreeMap<String, Registered>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every built-in query registered for all chains.
    pub fn builtin(timestamp_tolerance_ms: u64) -> Self {
        let mut catalog = Self::new();
        for field in BalanceField::ALL {
            catalog.register(Arc::new(BalanceQuery::new(field)));
        }
        for action in [
            "nominationPools:rewards",
            "nominationPools:state",
            "nominationPools:roles",
            "nominationPools:commission",
            "nominating:exposure",
            "nominating:commission",
            "nominating:nominations",
        ] {
            catalog.register(Arc::new(RawStorageQuery::new(action)));
        }
        catalog.register(Arc::new(U64StorageQuery::new(
            "chain:timestamp",
            TIMESTAMP_NOW_KEY,
            ChangePolicy::MonotonicWithTolerance(timestamp_tolerance_ms),
        )));
        catalog.register(Arc::new(U64StorageQuery::new(
            "chain:currentSlot",
            CURRENT_SLOT_KEY,
            ChangePolicy::Exact,
        )));
        catalog
    }

    /// Register a query available on every chain. Replaces any previous
    /// registration for the same action.
    pub fn register(&mut self, query: Arc<dyn ChainQuery>) {
        self.queries.insert(
            query.action().to_string(),
            Registered {
                query,
                chains: None,
            },
        );
    }

    /// Register a query restricted to `chains`.
    pub fn register_for<I, S>(&mut self, chains: I, query: Arc<dyn ChainQuery>)
    where
        I: IntoIterator<Item = S>,
        S: Into<ChainId>,
    {
        self.queries.insert(
            query.action().to_string(),
            Registered {
                query,
                chains: Some(chains.into_iter().map(Into::into).collect()),
            },
        );
    }

    /// Registered action identifiers, sorted.
    pub fn actions(&self) -> Vec<&str> {
        self.queries.keys().map(String::as_str).collect()
    }
}

impl QueryCatalog for StaticCatalog {
    fn resolve(&self, chain_id: &str, action: &str) -> Result<Arc<dyn ChainQuery>, WatchError> {
        match self.queries.get(action) {
            Some(r) if r.chains.as_ref().map_or(true, |c| c.contains(chain_id)) => {
                Ok(Arc::clone(&r.query))
            }
            _ => Err(WatchError::ActionNotFound {
                chain_id: chain_id.to_string(),
                action: action.to_string(),
            }),
        }
    }
}

// ─── Built-in queries ────────────────────────────────────────────────────────

/// Storage key supplied as the task's first argument.
fn key_from_args(task: &SubscriptionTask) -> Result<QueryCall, WatchError> {
    task.args()
        .first()
        .map(QueryCall::storage)
        .ok_or_else(|| {
            WatchError::Decode(format!(
                "action '{}' requires a storage key argument",
                task.action
            ))
        })
}

/// Raw SCALE bytes of a streamed storage value; `None` if storage is empty.
fn storage_bytes(raw: &Value) -> Result<Option<Vec<u8>>, WatchError> {
    match raw {
        Value::Null => Ok(None),
        Value::String(s) => {
            let s = s.strip_prefix("0x").unwrap_or(s);
            hex::decode(s)
                .map(Some)
                .map_err(|e| WatchError::Decode(format!("bad storage hex: {e}")))
        }
        other => Err(WatchError::Decode(format!(
            "expected hex storage value, got {other}"
        ))),
    }
}

fn read_u128_le(bytes: &[u8], offset: usize) -> Result<u128, WatchError> {
    let slice = bytes
        .get(offset..offset + 16)
        .ok_or_else(|| WatchError::Decode(format!("value too short for u128 at {offset}")))?;
    let mut buf = [0u8; 16];
    buf.copy_from_slice(slice);
    Ok(u128::from_le_bytes(buf))
}

fn read_u64_le(bytes: &[u8]) -> Result<u64, WatchError> {
    let slice = bytes
        .get(..8)
        .ok_or_else(|| WatchError::Decode("value too short for u64".into()))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_le_bytes(buf))
}

/// Which part of `System::Account` a balance query reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceField {
    Free,
    Reserved,
    Frozen,
    Spendable,
}

impl BalanceField {
    pub const ALL: [BalanceField; 4] = [Self::Free, Self::Reserved, Self::Frozen, Self::Spendable];

    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Frozen => "frozen",
            Self::Spendable => "spendable",
        }
    }
}

/// `System::Account` balance query. Arg 0 is the account's storage key.
///
/// `AccountInfo` layout: nonce, consumers, providers, sufficients (u32 each)
/// followed by free, reserved, frozen, flags (u128 each).
pub struct BalanceQuery {
    action: String,
    field: BalanceField,
}

impl BalanceQuery {
    const DATA_OFFSET: usize = 16;

    pub fn new(field: BalanceField) -> Self {
        Self {
            action: format!("balance:{}", field.name()),
            field,
        }
    }
}

impl ChainQuery for BalanceQuery {
    fn action(&self) -> &str {
        &self.action
    }

    fn call(&self, task: &SubscriptionTask) -> Result<QueryCall, WatchError> {
        key_from_args(task)
    }

    fn decode(&self, raw: &Value) -> Result<Value, WatchError> {
        let (free, reserved, frozen) = match storage_bytes(raw)? {
            None => (0, 0, 0),
            Some(bytes) => (
                read_u128_le(&bytes, Self::DATA_OFFSET)?,
                read_u128_le(&bytes, Self::DATA_OFFSET + 16)?,
                read_u128_le(&bytes, Self::DATA_OFFSET + 32)?,
            ),
        };
        let amount = match self.field {
            BalanceField::Free => free,
            BalanceField::Reserved => reserved,
            BalanceField::Frozen => frozen,
            BalanceField::Spendable => free.saturating_sub(frozen.saturating_sub(reserved)),
        };
        // u128 does not fit a JSON number; balances travel as decimal strings.
        let mut out = serde_json::Map::new();
        out.insert(self.field.name().to_string(), Value::String(amount.to_string()));
        Ok(Value::Object(out))
    }
}

/// Opaque storage query: reports the raw value so that any change fires.
/// Arg 0 is the storage key.
pub struct RawStorageQuery {
    action: String,
}

impl RawStorageQuery {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
        }
    }
}

impl ChainQuery for RawStorageQuery {
    fn action(&self) -> &str {
        &self.action
    }

    fn call(&self, task: &SubscriptionTask) -> Result<QueryCall, WatchError> {
        key_from_args(task)
    }

    fn decode(&self, raw: &Value) -> Result<Value, WatchError> {
        storage_bytes(raw)?;
        Ok(json!({ "raw": raw }))
    }
}

/// A fixed-key storage item holding a little-endian `u64`.
pub struct U64StorageQuery {
    action: String,
    key: String,
    policy: ChangePolicy,
}

impl U64StorageQuery {
    pub fn new(action: impl Into<String>, key: impl Into<String>, policy: ChangePolicy) -> Self {
        Self {
            action: action.into(),
            key: key.into(),
            policy,
        }
    }
}

impl ChainQuery for U64StorageQuery {
    fn action(&self) -> &str {
        &self.action
    }

    fn call(&self, _task: &SubscriptionTask) -> Result<QueryCall, WatchError> {
        Ok(QueryCall::storage(&self.key))
    }

    fn decode(&self, raw: &Value) -> Result<Value, WatchError> {
        match storage_bytes(raw)? {
            None => Ok(Value::Null),
            Some(bytes) => Ok(json!(read_u64_le(&bytes)?)),
        }
    }

    fn change_policy(&self) -> ChangePolicy {
        self.policy
    }
}

/// Query whose streamed values are already decoded JSON. The slot key is the
/// task's first argument, falling back to the action name.
pub struct PassthroughQuery {
    action: String,
    policy: ChangePolicy,
}

impl PassthroughQuery {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            policy: ChangePolicy::Exact,
        }
    }

    pub fn with_policy(mut self, policy: ChangePolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl ChainQuery for PassthroughQuery {
    fn action(&self) -> &str {
        &self.action
    }

    fn call(&self, task: &SubscriptionTask) -> Result<QueryCall, WatchError> {
        Ok(key_from_args(task).unwrap_or_else(|_| QueryCall::storage(&self.action)))
    }

    fn decode(&self, raw: &Value) -> Result<Value, WatchError> {
        Ok(raw.clone())
    }

    fn change_policy(&self) -> ChangePolicy {
        self.policy
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn account_info_hex(free: u128, reserved: u128, frozen: u128) -> Value {
        let mut bytes = vec![0u8; 16];
        bytes.extend_from_slice(&free.to_le_bytes());
        bytes.extend_from_slice(&reserved.to_le_bytes());
        bytes.extend_from_slice(&frozen.to_le_bytes());
        bytes.extend_from_slice(&0u128.to_le_bytes());
        Value::String(format!("0x{}", hex::encode(bytes)))
    }

    #[test]
    fn unknown_action_is_not_found() {
        let catalog = StaticCatalog::builtin(DEFAULT_TIMESTAMP_TOLERANCE_MS);
        let err = catalog.resolve("Polkadot Relay", "balance:imaginary").err().unwrap();
        assert!(matches!(err, WatchError::ActionNotFound { .. }));
    }

    #[test]
    fn chain_restricted_registration() {
        let mut catalog = StaticCatalog::new();
        catalog.register_for(["Kusama Relay"], Arc::new(PassthroughQuery::new("x")));
        assert!(catalog.resolve("Kusama Relay", "x").is_ok());
        assert!(catalog.resolve("Polkadot Relay", "x").is_err());
    }

    #[test]
    fn balance_fields_decode_from_account_info() {
        let raw = account_info_hex(1_000, 200, 500);
        let free = BalanceQuery::new(BalanceField::Free).decode(&raw).unwrap();
        assert_eq!(free, json!({"free": "1000"}));
        let spendable = BalanceQuery::new(BalanceField::Spendable).decode(&raw).unwrap();
        // frozen 500 minus reserved 200 is locked on top of reserve
        assert_eq!(spendable, json!({"spendable": "700"}));
    }

    #[test]
    fn missing_account_decodes_as_zero() {
        let free = BalanceQuery::new(BalanceField::Free).decode(&Value::Null).unwrap();
        assert_eq!(free, json!({"free": "0"}));
    }

    #[test]
    fn truncated_account_info_is_decode_error() {
        let err = BalanceQuery::new(BalanceField::Frozen)
            .decode(&json!("0x0011"))
            .unwrap_err();
        assert!(matches!(err, WatchError::Decode(_)));
    }

    #[test]
    fn timestamp_query_is_monotonic_with_tolerance() {
        let catalog = StaticCatalog::builtin(6_000);
        let q = catalog.resolve("Polkadot Relay", "chain:timestamp").unwrap();
        assert_eq!(q.change_policy(), ChangePolicy::MonotonicWithTolerance(6_000));
        let raw = Value::String(format!("0x{}", hex::encode(1_700_000_000_000u64.to_le_bytes())));
        assert_eq!(q.decode(&raw).unwrap(), json!(1_700_000_000_000u64));
    }

    #[test]
    fn balance_call_requires_storage_key() {
        let task = SubscriptionTask::chain("Polkadot Relay", "balance:free", "Free");
        assert!(BalanceQuery::new(BalanceField::Free).call(&task).is_err());
        let task = task.with_args(vec!["0xabc".into()]);
        assert_eq!(
            BalanceQuery::new(BalanceField::Free).call(&task).unwrap(),
            QueryCall::storage("0xabc")
        );
    }
}
