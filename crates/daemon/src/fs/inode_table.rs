//! Bidirectional mapping between kernel inode numbers and nodes of the
//! mounted namespace.
//!
//! The mount is two-level: the root lists configured folders as
//! directories, and everything below a folder is a path in that folder's
//! tree.

use std::collections::HashMap;

/// Inode of the mount root.
pub const ROOT_INODE: u64 = 1;

/// A node of the mounted namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodePath {
    /// The mount root, listing folders.
    Root,
    /// A folder's root directory.
    Folder(String),
    /// An entry inside a folder; `path` is folder-relative.
    Entry { folder: String, path: String },
}

impl NodePath {
    /// The node a directory entry named `name` resolves to under `self`.
    pub fn child(&self, name: &str) -> NodePath {
        match self {
            NodePath::Root => NodePath::Folder(name.to_string()),
            NodePath::Folder(folder) => NodePath::Entry {
                folder: folder.clone(),
                path: name.to_string(),
            },
            NodePath::Entry { folder, path } => NodePath::Entry {
                folder: folder.clone(),
                path: format!("{path}/{name}"),
            },
        }
    }
}

#[derive(Debug)]
pub struct InodeTable {
    node_to_inode: HashMap<NodePath, u64>,
    inode_to_node: HashMap<u64, NodePath>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            node_to_inode: HashMap::new(),
            inode_to_node: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.node_to_inode.insert(NodePath::Root, ROOT_INODE);
        table.inode_to_node.insert(ROOT_INODE, NodePath::Root);
        table
    }

    /// Inode for `node`, allocating one on first sight.
    pub fn get_or_create(&mut self, node: &NodePath) -> u64 {
        if let Some(&inode) = self.node_to_inode.get(node) {
            return inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.node_to_inode.insert(node.clone(), inode);
        self.inode_to_node.insert(inode, node.clone());
        inode
    }

    pub fn get_node(&self, inode: u64) -> Option<&NodePath> {
        self.inode_to_node.get(&inode)
    }

    /// Forget a node, e.g. after the kernel drops its reference.
    pub fn remove(&mut self, inode: u64) -> Option<NodePath> {
        let node = self.inode_to_node.remove(&inode)?;
        self.node_to_inode.remove(&node);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preregistered() {
        let mut table = InodeTable::new();
        assert_eq!(table.get_node(ROOT_INODE), Some(&NodePath::Root));
        assert_eq!(table.get_or_create(&NodePath::Root), ROOT_INODE);
    }

    #[test]
    fn allocation_is_stable() {
        let mut table = InodeTable::new();
        let folder = NodePath::Root.child("photos");
        let ino = table.get_or_create(&folder);
        assert!(ino > ROOT_INODE);
        assert_eq!(table.get_or_create(&folder), ino);
        assert_eq!(table.get_node(ino), Some(&folder));
    }

    #[test]
    fn child_resolution_builds_relative_paths() {
        let folder = NodePath::Root.child("photos");
        let album = folder.child("album");
        let shot = album.child("shot.jpg");
        assert_eq!(
            shot,
            NodePath::Entry {
                folder: "photos".to_string(),
                path: "album/shot.jpg".to_string()
            }
        );
    }

    #[test]
    fn removed_nodes_are_forgotten() {
        let mut table = InodeTable::new();
        let node = NodePath::Root.child("gone");
        let ino = table.get_or_create(&node);
        assert_eq!(table.remove(ino), Some(node.clone()));
        assert_eq!(table.get_node(ino), None);
        // a fresh inode is handed out next time
        assert_ne!(table.get_or_create(&node), ino);
    }
}
