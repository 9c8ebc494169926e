//! Per-folder directory of block payloads.
//!
//! One flat directory per folder under the config directory, one file per
//! block, named by the URL-safe base64 of the block hash. Blob I/O is
//! deliberately non-transactional: the store's `cached_blocks` /
//! `pinned_blocks` rows are the source of truth for whether a payload
//! *should* exist, and a missing file is recovered as a cache miss.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::protocol::BlockHash;

/// Handle on one folder's blob directory.
#[derive(Debug, Clone)]
pub struct BlobDir {
    dir: PathBuf,
}

impl BlobDir {
    /// Open (creating if missing) the blob directory for `folder`.
    pub fn open(root: &Path, folder: &str) -> io::Result<Self> {
        let dir = root.join(folder);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, hash: &BlockHash) -> PathBuf {
        self.dir.join(hash.to_base64())
    }

    pub async fn write(&self, hash: &BlockHash, data: &[u8]) -> io::Result<()> {
        tokio::fs::write(self.path_for(hash), data).await
    }

    /// Read a payload; `Ok(None)` when the file does not exist.
    pub async fn read(&self, hash: &BlockHash) -> io::Result<Option<Bytes>> {
        match tokio::fs::read(self.path_for(hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal; absent files are not an error.
    pub async fn remove(&self, hash: &BlockHash) {
        if let Err(e) = tokio::fs::remove_file(self.path_for(hash)).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(hash = %hash, error = %e, "failed to remove blob");
            }
        }
    }
}

/// Delete a folder's entire blob directory. Used when a folder disappears
/// from configuration; idempotent.
pub async fn remove_folder_blobs(root: &Path, folder: &str) -> io::Result<()> {
    match tokio::fs::remove_dir_all(root.join(folder)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
