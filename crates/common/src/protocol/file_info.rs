use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::version_vector::VersionVector;

/// Content address of a block: the SHA-256 of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash the given payload.
    pub fn of_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// URL-safe base64 form, used as the store key and the blob file name.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Inverse of [`Self::to_base64`]; `None` for malformed keys.
    pub fn from_base64(key: &str) -> Option<Self> {
        let raw = URL_SAFE_NO_PAD.decode(key).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// One fixed-size content-addressed unit of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

/// File-or-directory record as announced by a peer.
///
/// `name` is a POSIX-style path relative to the folder root, forward-slash
/// separated, with no leading slash; `""` is the root itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub kind: FileKind,
    pub deleted: bool,
    pub invalid: bool,
    /// Modification time, unix seconds.
    pub modified: i64,
    pub size: u64,
    pub version: VersionVector,
    /// Ordered block list; empty unless this is a live regular file.
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Whether two concurrent announcements resolve in this record's favor.
    ///
    /// The rule is deterministic and symmetric between the two orders the
    /// announcements can arrive in: the version vector's total order first,
    /// then the newer modification time, then the larger size.
    pub fn wins_conflict(&self, other: &FileInfo) -> bool {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                if self.modified != other.modified {
                    self.modified > other.modified
                } else {
                    self.size > other.size
                }
            }
        }
    }
}

/// Split a folder-relative path into its parent directory and base name.
/// The parent of a top-level name is `""` (the folder root).
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, base)) => (parent, base),
        None => ("", path),
    }
}
