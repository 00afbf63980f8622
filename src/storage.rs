//! Object storage for interpreter session state blobs.
//!
//! Blobs are keyed `<session-uuid>/<sprint-index>` and can be large, so they
//! live outside the relational store. The backend is swappable: the binary
//! uses the filesystem backend, tests use the in-memory one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{FlowhubError, Result};

/// Storage key for one sprint's serialized session state.
pub fn session_state_key(session_uuid: &Uuid, sprint: i32) -> String {
    format!("{session_uuid}/{sprint}")
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Reads an entire object, erroring if it does not exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes an object, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes an object. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed storage rooted at a configured directory.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // keys are generated, not user input, but keep them inside the root
        if key.contains("..") || key.starts_with('/') {
            return Err(FlowhubError::Storage(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| FlowhubError::Storage(format!("error reading {}: {e}", path.display())))?;
        Ok(Bytes::from(data))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FlowhubError::Storage(format!("error creating {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| FlowhubError::Storage(format!("error writing {}: {e}", path.display())))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FlowhubError::Storage(format!(
                "error deleting {}: {e}",
                path.display()
            ))),
        }
    }
}

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| FlowhubError::Storage(format!("no such object: {key}")))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());

        let uuid = Uuid::new_v4();
        let key = session_state_key(&uuid, 0);
        storage
            .put(&key, Bytes::from_static(b"{\"status\":\"waiting\"}"))
            .await
            .unwrap();

        let read = storage.get(&key).await.unwrap();
        assert_eq!(read.as_ref(), b"{\"status\":\"waiting\"}");

        storage.delete(&key).await.unwrap();
        assert!(storage.get(&key).await.is_err());
        // deleting again is fine
        storage.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(storage.get("../etc/passwd").await.is_err());
    }
}
