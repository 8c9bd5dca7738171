//! The blob store capability (§4.A, §6).
//!
//! A flat key/value object interface with conditional-put semantics. This is
//! the sole coordination primitive the write engine requires: everything
//! above this trait -- commits, manifests, checkpoints -- is built out of
//! `write(..., if_none_match)` racing.

use crate::error::{DbResult, Error};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// When true, the write MUST fail atomically with [`Error::AlreadyExists`]
    /// if the key already exists. This is the `ifNoneMatch: "*"` precondition
    /// from §4.A/§6.
    pub if_none_match: bool,
}

impl WriteOptions {
    pub fn if_none_match() -> Self {
        WriteOptions { if_none_match: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub keys: Vec<String>,
}

/// Capability interface a storage backend must provide. Implementors MUST
/// make `write(.., if_none_match: true)` atomic against concurrent writers;
/// everything else (compaction, vacuum, read-path fan-out) is free to
/// parallelize underlying I/O however it likes.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    async fn read(&self, key: &str) -> DbResult<Bytes>;

    async fn write(&self, key: &str, bytes: Bytes, options: WriteOptions) -> DbResult<()>;

    async fn delete(&self, key: &str) -> DbResult<()>;

    async fn list(&self, prefix: &str) -> DbResult<ListResult>;

    async fn exists(&self, key: &str) -> DbResult<bool> {
        match self.read(key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-memory blob store, used by tests and as the default embedding target
/// when no cloud credentials are configured.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: parking_lot::Mutex<std::collections::BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, key: &str) -> DbResult<Bytes> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, bytes: Bytes, options: WriteOptions) -> DbResult<()> {
        let mut objects = self.objects.lock();
        if options.if_none_match && objects.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> DbResult<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> DbResult<ListResult> {
        let keys = self
            .objects
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(ListResult { keys })
    }
}

/// Local-filesystem blob store, rooted at a base directory. `if_none_match`
/// is implemented with `OpenOptions::create_new`, which is atomic on POSIX
/// filesystems (the same primitive `tempfile` and friends rely on).
#[derive(Debug)]
pub struct LocalFsBlobStore {
    root: std::path::PathBuf,
}

impl LocalFsBlobStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        LocalFsBlobStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for LocalFsBlobStore {
    async fn read(&self, key: &str) -> DbResult<Bytes> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(Error::Transient(e.to_string())),
        }
    }

    async fn write(&self, key: &str, bytes: Bytes, options: WriteOptions) -> DbResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Transient(e.to_string()))?;
        }
        use tokio::io::AsyncWriteExt;
        let mut open_options = tokio::fs::OpenOptions::new();
        open_options.write(true);
        if options.if_none_match {
            open_options.create_new(true);
        } else {
            open_options.create(true).truncate(true);
        }
        let mut file = match open_options.open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(key.to_string()));
            }
            Err(e) => return Err(Error::Transient(e.to_string())),
        };
        file.write_all(&bytes)
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;
        file.flush().await.map_err(|e| Error::Transient(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> DbResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Transient(e.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> DbResult<ListResult> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Transient(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Transient(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(ListResult { keys })
    }
}
