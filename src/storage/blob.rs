//! Blob storage contract and filesystem implementation.
//!
//! The production deployment points this at object storage; the filesystem
//! variant keeps the same key semantics (prefix deletes included) for tests
//! and single-machine runs.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::core::errors::{ArchrevError, Result};

/// Object storage behind a narrow interface.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store bytes under a key.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fetch bytes by key.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// A URL a client could fetch the object from.
    async fn download_url(&self, key: &str) -> Result<String>;

    /// Remove every object whose key starts with `prefix`.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<()>;
}

/// Filesystem-backed blob storage rooted at one directory.
pub struct FsBlobStorage {
    root: PathBuf,
}

impl FsBlobStorage {
    /// Create storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are slash-separated but may never climb out of the root.
        if key.split('/').any(|segment| segment == "..") || key.starts_with('/') {
            return Err(ArchrevError::validation(
                "Blob.InvalidKey",
                format!("blob key escapes the storage root: {key}"),
            ));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchrevError::io("Cannot create blob directory", e))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| ArchrevError::io("Cannot write blob", e))?;
        debug!(key, "blob uploaded");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArchrevError::not_found(
                "Blob.NotFound",
                format!("no blob stored under {key}"),
            )),
            Err(e) => Err(ArchrevError::io("Cannot read blob", e)),
        }
    }

    async fn download_url(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        Ok(format!("file://{}", path.display()))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        // The prefix may be a directory or the leading part of a basename;
        // walk the parent and match on the joined relative key.
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0usize;
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if relative.starts_with(&prefix) && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
            removed
        })
        .await
        .map_err(|e| ArchrevError::internal(format!("blob delete task panicked: {e}")))?;

        debug!(removed, "blobs deleted by prefix");
        Ok(())
    }
}

impl std::fmt::Debug for FsBlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBlobStorage")
            .field("root", &self.root)
            .finish()
    }
}
