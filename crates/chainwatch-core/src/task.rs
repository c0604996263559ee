//! Subscription tasks — the unit of user intent.

use serde::{Deserialize, Serialize};

/// Chain identifier, e.g. `"Polkadot Relay"`.
pub type ChainId = String;

// ─── TaskStatus ──────────────────────────────────────────────────────────────

/// Whether the user wants a task to be watched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enable,
    Disable,
}

impl TaskStatus {
    pub fn is_enabled(self) -> bool {
        self == Self::Enable
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
        }
    }
}

// ─── AccountRef ──────────────────────────────────────────────────────────────

/// Flattened account reference carried by account-scoped tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub address: String,
    pub chain_id: ChainId,
    pub name: String,
}

// ─── TaskKey ─────────────────────────────────────────────────────────────────

/// Identity of a task. At most one task per key may be enabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Chain {
        chain_id: ChainId,
        action: String,
    },
    Account {
        chain_id: ChainId,
        address: String,
        action: String,
    },
}

impl TaskKey {
    pub fn chain_id(&self) -> &str {
        match self {
            Self::Chain { chain_id, .. } | Self::Account { chain_id, .. } => chain_id,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Self::Chain { action, .. } | Self::Account { action, .. } => action,
        }
    }

    /// Key under which the task is persisted in its store.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Chain { chain_id, action } => format!("{chain_id}:{action}"),
            Self::Account {
                chain_id,
                address,
                action,
            } => format!("{chain_id}:{address}:{action}"),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

// ─── SubscriptionTask ────────────────────────────────────────────────────────

/// A user-toggleable request to watch one chain-state query.
///
/// Field names serialize in camelCase so that task lists exported by the UI
/// layer (backup files) deserialize without a translation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTask {
    /// Stable identifier of the chain-state query, e.g. `"balance:free"`.
    pub action: String,
    pub chain_id: ChainId,
    pub status: TaskStatus,
    /// Display text for the toggle.
    pub label: String,
    /// Display grouping, e.g. `"Balances"`.
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_os_notifications: Option<bool>,
}

impl SubscriptionTask {
    /// A disabled chain-scoped task.
    pub fn chain(
        chain_id: impl Into<ChainId>,
        action: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            chain_id: chain_id.into(),
            status: TaskStatus::Disable,
            label: label.into(),
            category: String::new(),
            action_args: None,
            account: None,
            enable_os_notifications: None,
        }
    }

    /// A disabled task scoped to `account`.
    pub fn account(
        account: AccountRef,
        action: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            chain_id: account.chain_id.clone(),
            status: TaskStatus::Disable,
            label: label.into(),
            category: String::new(),
            action_args: None,
            account: Some(account),
            enable_os_notifications: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.action_args = Some(args);
        self
    }

    pub fn key(&self) -> TaskKey {
        match &self.account {
            Some(account) => TaskKey::Account {
                chain_id: self.chain_id.clone(),
                address: account.address.clone(),
                action: self.action.clone(),
            },
            None => TaskKey::Chain {
                chain_id: self.chain_id.clone(),
                action: self.action.clone(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status.is_enabled()
    }

    pub fn is_account_task(&self) -> bool {
        self.account.is_some()
    }

    pub fn os_notifications(&self) -> bool {
        self.enable_os_notifications.unwrap_or(false)
    }

    pub fn args(&self) -> &[String] {
        self.action_args.as_deref().unwrap_or(&[])
    }
}

// ─── TaskState ───────────────────────────────────────────────────────────────

/// Liveness of a task identity, tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Disabled,
    PendingSubscribe,
    Enabled,
    /// Persisted as enabled but the physical subscription is not established.
    EnabledButUnlive,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::PendingSubscribe => write!(f, "pending"),
            Self::Enabled => write!(f, "enabled"),
            Self::EnabledButUnlive => write!(f, "enabled (not live)"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> AccountRef {
        AccountRef {
            address: "15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5".into(),
            chain_id: "Polkadot Relay".into(),
            name: "Alice".into(),
        }
    }

    #[test]
    fn identity_distinguishes_scope() {
        let chain = SubscriptionTask::chain("Polkadot Relay", "chain:timestamp", "Timestamp");
        let account = SubscriptionTask::account(alice(), "chain:timestamp", "Timestamp");
        assert_ne!(chain.key(), account.key());
        assert_eq!(chain.key().storage_key(), "Polkadot Relay:chain:timestamp");
        assert_eq!(
            account.key().storage_key(),
            "Polkadot Relay:15oF4uVJwmo4TdGW7VfQxNLavjCXviqxT9S1MgbjMNHr6Sp5:chain:timestamp"
        );
    }

    #[test]
    fn identity_ignores_status_and_args() {
        let a = SubscriptionTask::account(alice(), "balance:free", "Free");
        let b = a
            .clone()
            .with_status(TaskStatus::Enable)
            .with_args(vec!["x".into()]);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn deserializes_camel_case_backup_entry() {
        let json = serde_json::json!({
            "action": "balance:free",
            "chainId": "Kusama Relay",
            "status": "enable",
            "label": "Free Balance",
            "actionArgs": ["HNZata7iMYWmk5RvZRTiAsSDhV8366zq2YGb3tLH5Upf74F"],
            "account": {
                "address": "HNZata7iMYWmk5RvZRTiAsSDhV8366zq2YGb3tLH5Upf74F",
                "chainId": "Kusama Relay",
                "name": "Cold"
            },
            "enableOsNotifications": true
        });
        let task: SubscriptionTask = serde_json::from_value(json).unwrap();
        assert!(task.is_enabled());
        assert!(task.os_notifications());
        assert_eq!(task.args().len(), 1);
        assert_eq!(task.category, "");
        assert_eq!(task.account.unwrap().name, "Cold");
    }
}
