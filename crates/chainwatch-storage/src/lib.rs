//! chainwatch-storage — key/value store backends for ChainWatch.
//!
//! Backends:
//! - [`MemoryStore`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

use std::sync::Arc;

use chainwatch_core::{KeyValueStore, WatchError};

pub use chainwatch_core::MemoryStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Open the store for `path`: SQLite when a path is given, memory otherwise.
pub async fn open_store(path: Option<&str>) -> Result<Arc<dyn KeyValueStore>, WatchError> {
    match path {
        None => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "sqlite")]
        Some(path) => Ok(Arc::new(sqlite::SqliteStore::open(path).await?)),
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(WatchError::Storage(format!(
            "cannot open {path}: built without the `sqlite` feature"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwatch_core::store::ACCOUNTS;
    use serde_json::json;

    #[tokio::test]
    async fn no_path_opens_memory_store() {
        let store = open_store(None).await.unwrap();
        store.set(ACCOUNTS, "a", json!(1)).await.unwrap();
        assert_eq!(store.get(ACCOUNTS, "a").await.unwrap(), Some(json!(1)));
    }

    #[cfg(not(feature = "sqlite"))]
    #[tokio::test]
    async fn path_requires_sqlite_feature() {
        let err = open_store(Some("./watch.db")).await.err().unwrap();
        assert!(matches!(err, WatchError::Storage(_)));
    }
}
