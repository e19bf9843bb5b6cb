// Artifact storage: immutable blobs produced by the render stage (DOM
// snapshots, fetched script bodies, network traces), keyed under
// `scans/{scan_id}/…`.
//
// The trait is the seam for an S3-compatible backend; the default
// implementation writes to a local directory root.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Delete every blob under the prefix; returns how many were removed.
    /// Best-effort by contract: callers log failures and move on.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError>;
}

// ============================================
// Key layout
// ============================================

pub fn scan_prefix(scan_id: Uuid) -> String {
    format!("scans/{}", scan_id)
}

pub fn dom_snapshot_key(scan_id: Uuid) -> String {
    format!("scans/{}/dom-snapshot.html", scan_id)
}

pub fn external_script_key(scan_id: Uuid, index: usize) -> String {
    format!("scans/{}/scripts/external-script-{}.js", scan_id, index)
}

pub fn network_trace_key(scan_id: Uuid) -> String {
    format!("scans/{}/network-trace.json", scan_id)
}

// ============================================
// Local filesystem backend
// ============================================

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key under the root, rejecting absolute paths and any `..`
    /// component so a hostile key cannot escape the store.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        if rel.is_absolute() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let path = self.resolve(prefix)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        let removed = count_files(&path).await?;
        tokio::fs::remove_dir_all(&path).await?;
        Ok(removed)
    }
}

async fn count_files(dir: &Path) -> Result<u64, StorageError> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let ty = entry.file_type().await?;
            if ty.is_dir() {
                stack.push(entry.path());
            } else {
                total += 1;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = store();
        let scan_id = Uuid::new_v4();
        let key = dom_snapshot_key(scan_id);
        store.put(&key, b"<html></html>").await.unwrap();
        let body = store.get(&key).await.unwrap();
        assert_eq!(body, b"<html></html>");
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let (_dir, store) = store();
        match store.get("scans/nope/dom-snapshot.html").await {
            Err(StorageError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_prefix_removes_all_scan_blobs() {
        let (_dir, store) = store();
        let scan_id = Uuid::new_v4();
        store
            .put(&dom_snapshot_key(scan_id), b"<html></html>")
            .await
            .unwrap();
        store
            .put(&external_script_key(scan_id, 0), b"var a = 1;")
            .await
            .unwrap();
        store
            .put(&external_script_key(scan_id, 1), b"var b = 2;")
            .await
            .unwrap();

        let other_scan = Uuid::new_v4();
        store
            .put(&dom_snapshot_key(other_scan), b"<html>other</html>")
            .await
            .unwrap();

        let removed = store.delete_prefix(&scan_prefix(scan_id)).await.unwrap();
        assert_eq!(removed, 3);

        assert!(store.get(&dom_snapshot_key(scan_id)).await.is_err());
        // Unrelated scans are untouched.
        assert!(store.get(&dom_snapshot_key(other_scan)).await.is_ok());
    }

    #[tokio::test]
    async fn delete_prefix_is_idempotent() {
        let (_dir, store) = store();
        let removed = store
            .delete_prefix(&scan_prefix(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.put("../escape.txt", b"x").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.delete_prefix("scans/../..").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
