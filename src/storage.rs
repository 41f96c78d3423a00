//! Central storage for checkpoint artifacts.
//!
//! Checkpoints are opaque blobs published by the master and fetched by
//! every node on restore. The backing store is deployment-specific: a
//! shared filesystem for small clusters, a remote blob service for large
//! ones. [`CentralStorage`] is the narrow contract the checkpoint manager
//! needs; [`CachedStorage`] optionally fronts a slow backing store with a
//! read-through cache so that many nodes restoring the same checkpoint
//! fetch it once.

use crate::error::{LocusError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Blob storage contract used for checkpoint artifacts.
#[async_trait]
pub trait CentralStorage: Send + Sync {
    /// Store a blob under the given name, replacing any existing blob.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fetch a blob. `None` means the name is unknown.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a blob, reporting whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Release resources held by the backend.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl CentralStorage for MemoryStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.blobs.write().insert(name.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.blobs.write().remove(name).is_some())
    }
}

/// Filesystem-backed storage rooted at a directory, usually a shared mount.
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Blob names may contain `/` separators; everything else is restricted
    /// to filename-safe characters.
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.split('/').any(|part| {
                part.is_empty()
                    || part == "."
                    || part == ".."
                    || part.contains(|c: char| !c.is_ascii_alphanumeric() && !"-_.".contains(c))
            })
        {
            return Err(LocusError::Storage(format!("invalid blob name: {:?}", name)));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl CentralStorage for FileSystemStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a partial blob.
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!(name, size = bytes.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read-through cache in front of a backing store.
///
/// Reads hit the cache first and populate it on miss; writes go to both so
/// a node re-reading its own checkpoint never touches the backing store.
pub struct CachedStorage {
    cache: MemoryStorage,
    backing: std::sync::Arc<dyn CentralStorage>,
}

impl CachedStorage {
    pub fn new(backing: std::sync::Arc<dyn CentralStorage>) -> Self {
        Self {
            cache: MemoryStorage::new(),
            backing,
        }
    }
}

#[async_trait]
impl CentralStorage for CachedStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        self.backing.put(name, bytes.clone()).await?;
        self.cache.put(name, bytes).await
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.cache.get(name).await? {
            return Ok(Some(bytes));
        }
        match self.backing.get(name).await? {
            Some(bytes) => {
                self.cache.put(name, bytes.clone()).await?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.cache.delete(name).await?;
        self.backing.delete(name).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.backing.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_put_get_delete() {
        let storage = MemoryStorage::new();
        storage.put("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(storage.delete("a").await.unwrap());
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert!(!storage.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());

        storage
            .put("checkpoints/c1.db", vec![9, 9])
            .await
            .unwrap();
        assert_eq!(
            storage.get("checkpoints/c1.db").await.unwrap(),
            Some(vec![9, 9])
        );
        assert_eq!(storage.get("checkpoints/missing").await.unwrap(), None);
        assert!(storage.delete("checkpoints/c1.db").await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemStorage::new(dir.path());
        assert!(storage.get("../outside").await.is_err());
        assert!(storage.put("", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_storage_reads_through() {
        let backing = Arc::new(MemoryStorage::new());
        backing.put("a", vec![1]).await.unwrap();

        let cached = CachedStorage::new(backing.clone() as Arc<dyn CentralStorage>);
        assert_eq!(cached.get("a").await.unwrap(), Some(vec![1]));

        // Now served from the cache even if the backing copy disappears.
        backing.delete("a").await.unwrap();
        assert_eq!(cached.get("a").await.unwrap(), Some(vec![1]));
    }
}
