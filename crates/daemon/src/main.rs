//! driftfs daemon entry point: load the configuration, bring the model
//! up, and run until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use driftfs_daemon::{logging, process};

#[derive(Parser)]
#[command(name = "driftfs", version, about = "Read-only lazy mount of a remote sync cluster")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "driftfs.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    logging::init_logging();
    let args = Args::parse();

    let (_model, shutdown) = match process::start(&args.config).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "startup failed");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for interrupt");
    }
    shutdown.shutdown();
    std::process::ExitCode::SUCCESS
}
