//! On-disk store for uploaded files. `SEND_FILE` frames carry only the
//! handle returned here.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use courier_shared::types::FileHandle;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// What an upload produced.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredBlob {
    pub handle: FileHandle,
    pub size: usize,
    /// Hex BLAKE3 digest of the content.
    pub blake3: String,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store_blob(&self, data: &[u8]) -> Result<StoredBlob, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty blob".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let handle = FileHandle(Uuid::new_v4());
        let path = self.safe_blob_path(handle)?;

        fs::write(&path, data).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to write blob {handle}: {e}"))
        })?;

        let digest = blake3::hash(data).to_hex().to_string();
        debug!(id = %handle, size = data.len(), blake3 = %digest, "Stored blob");
        Ok(StoredBlob {
            handle,
            size: data.len(),
            blake3: digest,
        })
    }

    pub async fn get_blob(&self, handle: FileHandle) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_blob_path(handle)?;

        if !self.exists(handle).await {
            return Err(ServerError::BlobNotFound(handle.0));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to read blob {handle}: {e}"))
        })?;

        debug!(id = %handle, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    pub async fn delete_blob(&self, handle: FileHandle) -> Result<(), ServerError> {
        let path = self.safe_blob_path(handle)?;

        if !self.exists(handle).await {
            return Err(ServerError::BlobNotFound(handle.0));
        }

        fs::remove_file(&path).await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to delete blob {handle}: {e}"))
        })?;

        debug!(id = %handle, "Deleted blob");
        Ok(())
    }

    /// Whether `handle` names a stored blob. Used to validate `SEND_FILE`.
    pub async fn exists(&self, handle: FileHandle) -> bool {
        match self.safe_blob_path(handle) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn count(&self) -> Result<usize, ServerError> {
        let mut count = 0;
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to list blobs: {e}")))?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ServerError::BlobStorage(format!("Failed to read directory entry: {e}"))
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if Uuid::parse_str(name).is_ok() {
                    count += 1;
                }
            }
        }

        Ok(count)
    }

    fn safe_blob_path(&self, handle: FileHandle) -> Result<PathBuf, ServerError> {
        let raw = self.base_path.join(handle.to_string());
        ensure_within(&self.base_path, &raw)
    }
}
