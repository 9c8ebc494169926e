//! Core of driftfs: a read-only, lazily populated mirror of a remote sync
//! cluster's shared folders.
//!
//! Peers announce file metadata over the sync protocol; the [`Model`]
//! maintains a replicated index per folder and serves ranged reads by
//! fetching blocks on demand into a bounded on-disk LRU cache. Files can
//! be pinned, which downloads their blocks proactively and exempts them
//! from eviction. All state survives restarts through an embedded store.
//!
//! The wire protocol, peer discovery, and the kernel filesystem bridge are
//! external; this crate consumes a [`protocol::Connection`] capability and
//! exposes path lookups and reads to the adapter in `driftfs-daemon`.

pub mod blobs;
pub mod block_cache;
pub mod config;
pub mod database;
pub mod model;
pub mod protocol;
pub mod tree_cache;

pub use config::{Config, ConfigPersister, DeviceConfig, FolderConfig};
pub use database::Database;
pub use model::{ConnectionInfo, FetchError, Model, ModelError, PinStatus};
