//! Service wiring for driftfs: configuration loading, the process
//! lifecycle, and the thin filesystem adapter the kernel bridge talks to.

pub mod fs;
pub mod logging;
pub mod process;
pub mod service_config;

pub use fs::{FileAttr, FsAdapter, FsError, NodeKind};
pub use process::{start, ShutdownHandle, StartError};
pub use service_config::{load_config, save_config, FileConfigPersister, ServiceConfigError};
