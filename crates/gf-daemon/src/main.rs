//! gafferd — the gaffer background daemon.
//!
//! Loads config, opens the persistent store (refusing to run on a corrupt
//! database), recovers stranded work, and serves until ctrl-c.

use anyhow::{Context, Result};
use tracing::info;

use gf_core::config::Config;
use gf_core::store::StoreError;
use gf_daemon::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("failed to create data dir {}", config.data_dir().display()))?;
    gf_telemetry::logging::init_logging_with_file(
        "gafferd",
        &config.general.log_level,
        &config.data_dir(),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %config.data_dir().display(),
        "gafferd starting"
    );

    let daemon = match Daemon::new(config).await {
        Ok(daemon) => daemon,
        Err(StoreError::Corrupt(verdict)) => {
            // A corrupt state file is fatal; refuse to run rather than
            // scribble over it.
            eprintln!("tasks.db failed integrity check ({verdict}); refusing to start");
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("failed to initialize daemon"),
    };

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await.context("daemon execution failed")?;
    Ok(())
}
