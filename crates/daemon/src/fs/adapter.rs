//! Translation of inode-based filesystem calls into model lookups and
//! ranged reads. The mount is read-only: directories are `0555`, files
//! `0444`, and `modified` drives mtime.

use std::sync::Mutex;

use thiserror::Error;

use driftfs_common::protocol::FileInfo;
use driftfs_common::{Model, ModelError};

use super::inode_table::{InodeTable, NodePath};

const DIR_MODE: u16 = 0o555;
const FILE_MODE: u16 = 0o444;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("read failed: {0}")]
    Io(String),
}

impl From<ModelError> for FsError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::NoSuchFile => FsError::NotFound,
            other => FsError::Io(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub kind: NodeKind,
    pub mode: u16,
    pub size: u64,
    /// Unix seconds.
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub kind: NodeKind,
}

/// Read-only filesystem surface over a [`Model`].
pub struct FsAdapter {
    model: Model,
    inodes: Mutex<InodeTable>,
}

impl FsAdapter {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn node_for(&self, ino: u64) -> Result<NodePath, FsError> {
        self.lock_inodes()
            .get_node(ino)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn inode_for(&self, node: &NodePath) -> u64 {
        self.lock_inodes().get_or_create(node)
    }

    fn lock_inodes(&self) -> std::sync::MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget an inode after the kernel releases it.
    pub fn forget(&self, ino: u64) {
        self.lock_inodes().remove(ino);
    }

    pub async fn getattr(&self, ino: u64) -> Result<FileAttr, FsError> {
        match self.node_for(ino)? {
            NodePath::Root => Ok(dir_attr(ino, 0)),
            NodePath::Folder(folder) => {
                if !self.model.has_folder(&folder).await {
                    return Err(FsError::NotFound);
                }
                Ok(dir_attr(ino, 0))
            }
            NodePath::Entry { folder, path } => {
                let entry = self
                    .model
                    .get_entry(&folder, &path)
                    .await?
                    .ok_or(FsError::NotFound)?;
                Ok(entry_attr(ino, &entry))
            }
        }
    }

    /// Resolve `name` under the directory `parent`.
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        let parent_node = self.node_for(parent)?;
        let child = parent_node.child(name);

        match &child {
            NodePath::Folder(folder) => {
                if !self.model.has_folder(folder).await {
                    return Err(FsError::NotFound);
                }
                let ino = self.inode_for(&child);
                Ok(dir_attr(ino, 0))
            }
            NodePath::Entry { folder, path } => {
                let entry = self
                    .model
                    .get_entry(folder, path)
                    .await?
                    .ok_or(FsError::NotFound)?;
                let ino = self.inode_for(&child);
                Ok(entry_attr(ino, &entry))
            }
            NodePath::Root => Err(FsError::NotFound),
        }
    }

    pub async fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>, FsError> {
        let node = self.node_for(ino)?;
        match &node {
            NodePath::Root => {
                let mut listing = Vec::new();
                for folder in self.model.list_folders().await {
                    let child = node.child(&folder);
                    listing.push(DirEntry {
                        ino: self.inode_for(&child),
                        name: folder,
                        kind: NodeKind::Directory,
                    });
                }
                Ok(listing)
            }
            NodePath::Folder(folder) => {
                if !self.model.has_folder(folder).await {
                    return Err(FsError::NotFound);
                }
                self.list_entries(&node, folder, "").await
            }
            NodePath::Entry { folder, path } => {
                let entry = self
                    .model
                    .get_entry(folder, path)
                    .await?
                    .ok_or(FsError::NotFound)?;
                if !entry.is_directory() {
                    return Err(FsError::NotADirectory);
                }
                self.list_entries(&node, folder, path).await
            }
        }
    }

    async fn list_entries(
        &self,
        node: &NodePath,
        folder: &str,
        path: &str,
    ) -> Result<Vec<DirEntry>, FsError> {
        let mut listing = Vec::new();
        for entry in self.model.get_children(folder, path).await? {
            let name = base_name(&entry.name).to_string();
            let child = node.child(&name);
            listing.push(DirEntry {
                ino: self.inode_for(&child),
                kind: if entry.is_directory() {
                    NodeKind::Directory
                } else {
                    NodeKind::RegularFile
                },
                name,
            });
        }
        Ok(listing)
    }

    /// Ranged read, clamped to the file's size.
    pub async fn read(&self, ino: u64, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        let NodePath::Entry { folder, path } = self.node_for(ino)? else {
            return Err(FsError::IsDirectory);
        };
        let entry = self
            .model
            .get_entry(&folder, &path)
            .await?
            .ok_or(FsError::NotFound)?;
        if entry.is_directory() {
            return Err(FsError::IsDirectory);
        }

        let len = clamp_len(entry.size, offset, size);
        if len == 0 {
            return Ok(Vec::new());
        }
        Ok(self.model.read(&folder, &path, offset, len).await?)
    }
}

fn dir_attr(ino: u64, mtime: i64) -> FileAttr {
    FileAttr {
        ino,
        kind: NodeKind::Directory,
        mode: DIR_MODE,
        size: 0,
        mtime,
    }
}

fn entry_attr(ino: u64, entry: &FileInfo) -> FileAttr {
    if entry.is_directory() {
        dir_attr(ino, entry.modified)
    } else {
        FileAttr {
            ino,
            kind: NodeKind::RegularFile,
            mode: FILE_MODE,
            size: entry.size,
            mtime: entry.modified,
        }
    }
}

/// Bytes actually readable from a file of `file_size` at `offset`.
fn clamp_len(file_size: u64, offset: u64, want: usize) -> usize {
    if offset >= file_size {
        return 0;
    }
    want.min((file_size - offset) as usize)
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
