use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;

/// Abstraction over the key-value store shared by every client context.
///
/// Plays the part browser tabs get from `localStorage`: values written by
/// one context are visible to the others. Values are plain strings.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn del(&self, key: &str) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (contexts inside one process / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.data.lock().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed implementation (contexts in separate processes)
// ---------------------------------------------------------------------------

/// A JSON object on disk, re-read on every access so writes made by other
/// processes are observed.
///
/// Writes go to a sibling temp file which is then renamed over the original.
/// There is no cross-process locking: two processes can still interleave a
/// read-modify-write, which is the same guarantee `localStorage` gives.
pub struct FileStore {
    path: PathBuf,
    write_guard: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, data: &HashMap<String, String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(data)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.write_guard.lock().await;
        let mut data = self.load().await?;
        data.insert(key.to_string(), value.to_string());
        self.save(&data).await
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_guard.lock().await;
        let mut data = self.load().await?;
        if data.remove(key).is_some() {
            self.save(&data).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_set_get_del() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));

        store.del("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");

        // Two handles on the same file behave like two processes.
        let a = FileStore::new(&path);
        let b = FileStore::new(&path);

        a.set("tugo.tokenRefreshLock", "1700000000000").await.unwrap();
        assert_eq!(
            b.get("tugo.tokenRefreshLock").await.unwrap().as_deref(),
            Some("1700000000000")
        );

        b.del("tugo.tokenRefreshLock").await.unwrap();
        assert!(a.get("tugo.tokenRefreshLock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("never-written.json"));
        assert!(store.get("anything").await.unwrap().is_none());
        // Deleting from a missing file is not an error.
        store.del("anything").await.unwrap();
    }

    #[tokio::test]
    async fn file_store_reports_corrupt_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(
            store.get("k").await,
            Err(StorageError::Corrupt(_))
        ));
    }
}
