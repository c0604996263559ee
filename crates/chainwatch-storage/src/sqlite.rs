//! SQLite store backend for ChainWatch.
//!
//! Persists every named store as rows of one `kv` table in a single SQLite
//! file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainwatch_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./chainwatch.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainwatch_core::{KeyValueStore, WatchError};

fn storage_err(e: impl std::fmt::Display) -> WatchError {
    WatchError::Storage(e.to_string())
}

/// SQLite-backed [`KeyValueStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chainwatch.db"`) or a full
    /// SQLite URL (`"sqlite:./chainwatch.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, WatchError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "sqlite store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single pooled connection, since every `:memory:` connection is its
    /// own database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, WatchError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the table and enable WAL mode.
    async fn init_schema(&self) -> Result<(), WatchError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                store      TEXT    NOT NULL,
                key        TEXT    NOT NULL,
                value      TEXT    NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (store, key)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of rows in `store`.
    pub async fn count(&self, store: &str) -> Result<u64, WatchError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM kv WHERE store = ?")
            .bind(store)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

fn parse(text: &str) -> Result<Value, WatchError> {
    serde_json::from_str(text).map_err(storage_err)
}

// ─── KeyValueStore impl ──────────────────────────────────────────────────────

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, WatchError> {
        let row = sqlx::query("SELECT value FROM kv WHERE store = ? AND key = ?")
            .bind(store)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| parse(&r.get::<String, _>("value"))).transpose()
    }

    async fn set(&self, store: &str, key: &str, value: Value) -> Result<(), WatchError> {
        sqlx::query(
            "INSERT OR REPLACE INTO kv (store, key, value, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(store)
        .bind(key)
        .bind(value.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(store, key, "value stored");
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), WatchError> {
        sqlx::query("DELETE FROM kv WHERE store = ? AND key = ?")
            .bind(store)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, WatchError> {
        Ok(self.get_all_objects(store).await?.into_values().collect())
    }

    async fn get_all_objects(&self, store: &str) -> Result<BTreeMap<String, Value>, WatchError> {
        let rows = sqlx::query("SELECT key, value FROM kv WHERE store = ? ORDER BY key")
            .bind(store)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut out = BTreeMap::new();
        for row in rows {
            let key: String = row.get("key");
            let value: String = row.get("value");
            out.insert(key, parse(&value)?);
        }
        Ok(out)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainwatch_core::store::{ACCOUNT_TASKS, EVENTS};
    use serde_json::json;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let task = json!({"action": "balance:free", "chainId": "Polkadot Relay", "status": "enable"});

        store.set(ACCOUNT_TASKS, "Polkadot Relay:1abc:balance:free", task.clone()).await.unwrap();
        let loaded = store
            .get(ACCOUNT_TASKS, "Polkadot Relay:1abc:balance:free")
            .await
            .unwrap();
        assert_eq!(loaded, Some(task));
        assert_eq!(store.get(ACCOUNT_TASKS, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_upserts() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set(EVENTS, "e1", json!(1)).await.unwrap();
        store.set(EVENTS, "e1", json!(2)).await.unwrap();
        assert_eq!(store.count(EVENTS).await.unwrap(), 1);
        assert_eq!(store.get(EVENTS, "e1").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn stores_are_isolated_and_ordered() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set(EVENTS, "b", json!("second")).await.unwrap();
        store.set(EVENTS, "a", json!("first")).await.unwrap();
        store.set(ACCOUNT_TASKS, "a", json!("other")).await.unwrap();

        assert_eq!(store.get_all(EVENTS).await.unwrap(), vec![json!("first"), json!("second")]);
        let objects = store.get_all_objects(ACCOUNT_TASKS).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects["a"], json!("other"));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set(EVENTS, "e1", json!(1)).await.unwrap();
        store.set(EVENTS, "e2", json!(2)).await.unwrap();
        store.delete(EVENTS, "e1").await.unwrap();
        assert_eq!(store.count(EVENTS).await.unwrap(), 1);
        assert_eq!(store.get(EVENTS, "e1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn generic_event_pruning_works_on_sqlite() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set(EVENTS, "old", json!({"timestamp": 10})).await.unwrap();
        store.set(EVENTS, "new", json!({"timestamp": 20})).await.unwrap();
        assert_eq!(chainwatch_core::prune_events(&store, 15).await.unwrap(), 1);
        assert_eq!(store.count(EVENTS).await.unwrap(), 1);
    }
}
