//! The filesystem face of the model.
//!
//! The kernel bridge resolves inodes and issues ranged reads; which paths
//! exist, their attributes, and their bytes all come from the model. This
//! module is deliberately thin: an inode ↔ node mapping and the
//! attribute/readdir/read translation.

mod adapter;
mod inode_table;

pub use adapter::{DirEntry, FileAttr, FsAdapter, FsError, NodeKind};
pub use inode_table::{InodeTable, NodePath, ROOT_INODE};
