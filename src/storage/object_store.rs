//! Object Store Abstraction
//!
//! The durable substrate under a partition. Keys are `/`-separated paths
//! relative to the store root. The only primitives the partition core
//! relies on are whole-object `put`, `get`, `head` and an atomic `rename`
//! used to publish manifests.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit tests and DST
//! - `LocalFsObjectStore`: local disk, fsync on put
//! - `SimulatedObjectStore`: fault-injecting wrapper (see `simulated_store`)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Creation timestamp (Unix ms)
    pub created_at_ms: u64,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite), durable once the future resolves
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Delete an object (deleting a missing object succeeds)
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// List objects whose key starts with `prefix`, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>>;

    /// Atomically rename an object, replacing `to` if present
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()>;

    /// Get object metadata without downloading content
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta>;
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn not_found(key: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

/// In-memory object store. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    created_at_ms: u64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Overwrite an object's bytes directly, bypassing the trait (tests only)
    pub fn corrupt(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.data.write().get_mut(key) {
            Some(obj) => {
                f(&mut obj.data);
                true
            }
            None => false,
        }
    }

    /// Remove an object directly, bypassing the trait (tests only)
    pub fn remove(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let obj = StoredObject {
                data: data.to_vec(),
                created_at_ms: now_ms(),
            };
            self.data.write().insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| not_found(key))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let data = self.data.read();
            let mut objects: Vec<ObjectMeta> = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.data.len() as u64,
                    created_at_ms: v.created_at_ms,
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut data = self.data.write();
            match data.remove(from) {
                Some(obj) => {
                    data.insert(to.to_string(), obj);
                    Ok(())
                }
                None => Err(IoError::new(
                    ErrorKind::NotFound,
                    format!("Source key not found: {}", from),
                )),
            }
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| ObjectMeta {
                    key: key.to_string(),
                    size_bytes: obj.data.len() as u64,
                    created_at_ms: obj.created_at_ms,
                })
                .ok_or_else(|| not_found(key))
        })
    }
}

// ============================================================================
// LocalFsObjectStore - Local disk
// ============================================================================

/// Local filesystem object store rooted at `base_path`
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn meta_from(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key,
            size_bytes: metadata.len(),
            created_at_ms: metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    fn walk_dir(dir: &Path, base: &Path, prefix: &str, out: &mut Vec<ObjectMeta>) -> IoResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk_dir(&path, base, prefix, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                let metadata = std::fs::metadata(&path)?;
                out.push(Self::meta_from(key, &metadata));
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;

            let path = self.full_path(key);
            Self::ensure_parent(&path).await?;
            let mut file = tokio::fs::File::create(&path).await?;
            file.write_all(data).await?;
            file.sync_all().await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.full_path(key)).await })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                if base.exists() {
                    Self::walk_dir(&base, &base, &prefix, &mut objects)?;
                }
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok::<_, IoError>(objects)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e))?
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let to_path = self.full_path(to);
            Self::ensure_parent(&to_path).await?;
            tokio::fs::rename(self.full_path(from), &to_path).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(self.full_path(key)).await?;
            Ok(Self::meta_from(key.to_string(), &metadata))
        })
    }
}

// ============================================================================
// ConfiguredStore - backend chosen at runtime
// ============================================================================

/// Store selected by [`StorageConfig::backend`](crate::config::StorageConfig)
#[derive(Debug, Clone)]
pub enum ConfiguredStore {
    InMemory(InMemoryObjectStore),
    LocalFs(LocalFsObjectStore),
}

impl ConfiguredStore {
    pub fn from_config(config: &crate::config::StorageConfig) -> Self {
        match config.backend {
            crate::config::StorageBackend::InMemory => {
                ConfiguredStore::InMemory(InMemoryObjectStore::new())
            }
            crate::config::StorageBackend::LocalFs => {
                ConfiguredStore::LocalFs(LocalFsObjectStore::new(&config.root_dir))
            }
        }
    }
}

macro_rules! delegate {
    ($self:ident, $method:ident($($arg:expr),*)) => {
        match $self {
            ConfiguredStore::InMemory(s) => s.$method($($arg),*),
            ConfiguredStore::LocalFs(s) => s.$method($($arg),*),
        }
    };
}

impl ObjectStore for ConfiguredStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        delegate!(self, put(key, data))
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        delegate!(self, get(key))
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        delegate!(self, exists(key))
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        delegate!(self, delete(key))
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        delegate!(self, list(prefix))
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        delegate!(self, rename(from, to))
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        delegate!(self, head(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("test/key1", b"hello world").await.unwrap();
        let data = store.get("test/key1").await.unwrap();

        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_inmemory_get_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_inmemory_list_sorted_by_prefix() {
        let store = InMemoryObjectStore::new();

        store.put("p/data/0002.seg", b"b").await.unwrap();
        store.put("p/data/0001.seg", b"a").await.unwrap();
        store.put("p/manifest.json", b"m").await.unwrap();

        let objects = store.list("p/data/").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["p/data/0001.seg", "p/data/0002.seg"]);
    }

    #[tokio::test]
    async fn test_inmemory_rename_replaces_target() {
        let store = InMemoryObjectStore::new();

        store.put("manifest.json", b"old").await.unwrap();
        store.put("manifest.json.tmp", b"new").await.unwrap();
        store.rename("manifest.json.tmp", "manifest.json").await.unwrap();

        assert!(!store.exists("manifest.json.tmp").await.unwrap());
        assert_eq!(store.get("manifest.json").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_inmemory_head() {
        let store = InMemoryObjectStore::new();
        store.put("k", b"12345").await.unwrap();

        let meta = store.head("k").await.unwrap();
        assert_eq!(meta.key, "k");
        assert_eq!(meta.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_localfs_round_trip_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("ns/t/p/manifest.json.tmp", b"data").await.unwrap();
        store
            .rename("ns/t/p/manifest.json.tmp", "ns/t/p/manifest.json")
            .await
            .unwrap();

        assert!(!store.exists("ns/t/p/manifest.json.tmp").await.unwrap());
        assert_eq!(store.get("ns/t/p/manifest.json").await.unwrap(), b"data");
        assert_eq!(store.head("ns/t/p/manifest.json").await.unwrap().size_bytes, 4);
    }

    #[tokio::test]
    async fn test_localfs_list_uses_slash_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("a/data/1.seg", b"1").await.unwrap();
        store.put("a/data/2.seg", b"2").await.unwrap();
        store.put("b/manifest.json", b"3").await.unwrap();

        let objects = store.list("a/").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert!(objects.iter().all(|o| o.key.starts_with("a/data/")));
    }

    #[tokio::test]
    async fn test_localfs_delete_missing_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_store_backends() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::StorageConfig {
            backend: crate::config::StorageBackend::LocalFs,
            root_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let store = ConfiguredStore::from_config(&config);
        assert!(matches!(store, ConfiguredStore::LocalFs(_)));
        store.put("a/b", b"x").await.unwrap();
        assert!(dir.path().join("a/b").exists());

        let memory = ConfiguredStore::from_config(&crate::config::StorageConfig::default());
        assert!(matches!(memory, ConfiguredStore::InMemory(_)));
    }
}
