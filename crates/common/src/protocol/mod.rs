//! Semantic surface of the sync protocol.
//!
//! The wire format, TLS transport, and peer discovery are external
//! collaborators; this module defines only the types the core consumes:
//! file and block metadata as announced by peers, version vectors, the
//! cluster-config message, and the [`Connection`] capability the model
//! drives to fetch blocks.

mod connection;
mod device_id;
mod file_info;
mod messages;
mod version_vector;

pub use connection::{Connection, RequestError};
pub use device_id::DeviceId;
pub use file_info::{BlockHash, BlockInfo, FileInfo, FileKind};
pub(crate) use file_info::split_path;
pub use messages::{ClusterConfig, DeviceAnnouncement, FolderAnnouncement};
pub use version_vector::{Counter, Ordering, VersionVector};

/// Default size of a content-addressed block. The last block of a file may
/// be shorter; all others are exactly this long.
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;
