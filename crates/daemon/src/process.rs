//! Process lifecycle: bring the model up from a configuration file, run
//! the background workers, and shut everything down on request.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use driftfs_common::model::ModelError;
use driftfs_common::{ConfigPersister, Database, Model};

use crate::service_config::{load_config, FileConfigPersister, ServiceConfigError};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ServiceConfigError),
    #[error("failed to create mount point: {0}")]
    MountPoint(std::io::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Database(#[from] driftfs_common::database::DatabaseError),
}

/// Flips the shutdown signal every background worker waits on. Dropping
/// the handle without calling [`ShutdownHandle::shutdown`] leaves workers
/// running until the model is dropped.
pub struct ShutdownHandle {
    tx: watch::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("shutting down");
        let _ = self.tx.send(());
    }
}

/// Start the service from the configuration at `config_path`: create the
/// mount point if missing, open the store beside the config file, build
/// the model, and spawn the pinner workers.
pub async fn start(config_path: &Path) -> Result<(Model, ShutdownHandle), StartError> {
    let config = load_config(config_path)?;

    std::fs::create_dir_all(&config.mount_point).map_err(StartError::MountPoint)?;

    let data_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let db = Database::open(data_dir).await?;

    let persister: Arc<dyn ConfigPersister> = Arc::new(FileConfigPersister::new(config_path));
    let model = Model::new(db, config, Some(persister)).await?;

    let (tx, rx) = watch::channel(());
    model.spawn_pinner_workers(rx);

    info!(config = %config_path.display(), "driftfs started");
    Ok((model, ShutdownHandle { tx }))
}
