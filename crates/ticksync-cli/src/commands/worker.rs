use tokio::sync::watch;

use ticksync_core::lookup::MaterializerWorker;
use ticksync_core::CentralSyncManager;

use crate::error::CliError;

/// Run the materializer in the foreground until Ctrl-C
pub async fn run_worker(manager: CentralSyncManager) -> Result<(), CliError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(MaterializerWorker::new(manager).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    // The worker may already be gone, which the join below reports
    let _ = shutdown_tx.send(true);

    worker
        .await
        .map_err(|error| CliError::Worker(error.to_string()))
}
