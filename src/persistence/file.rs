//! File-backed store: a `MemoryStore` snapshotted to JSON after every write

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{MemoryStore, Store, Subscription};
use crate::error::StoreError;

pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
    // Serializes mutate + snapshot so an older tree never overwrites a newer one
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading the previous tree if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let tree = match fs::read_to_string(&path).await {
            Ok(json) => {
                let tree: Value = serde_json::from_str(&json)?;
                info!(path = %path.display(), "💾 [STORE] State loaded");
                tree
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "💾 [STORE] No state file found, starting fresh");
                Value::Object(Map::new())
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: MemoryStore::with_tree(tree),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.inner.snapshot().await;
        let json = serde_json::to_string_pretty(&snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "💾 [STORE] State saved");
        Ok(())
    }
}

#[async_trait]
impl Store for JsonFileStore {
    fn name(&self) -> &'static str {
        "json-file"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.set(path, value).await?;
        self.persist().await
    }

    async fn update(&self, path: &str, partial: Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.update(path, partial).await?;
        self.persist().await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete(path).await?;
        self.persist().await
    }

    async fn stream(&self, path: &str) -> Result<Subscription, StoreError> {
        self.inner.stream(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("simfolio_store_test_{}", uuid::Uuid::new_v4()))
            .join("store.json")
    }

    #[tokio::test]
    async fn missing_file_starts_fresh() {
        let path = temp_store_path();
        let store = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(store.get("portfolios").await.unwrap(), None);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let path = temp_store_path();
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.set("portfolios/p1", json!({"name": "Growth"})).await.unwrap();
            store
                .update("portfolios/p1", json!({"is_active": true}))
                .await
                .unwrap();
            store.set("users/u1/portfolios/p1", json!(true)).await.unwrap();
            store.delete("users/u1").await.unwrap();
        }
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("portfolios/p1").await.unwrap(),
            Some(json!({"name": "Growth", "is_active": true}))
        );
        assert_eq!(reopened.get("users/u1").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let path = temp_store_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
