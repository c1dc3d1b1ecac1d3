use ticksync_core::CentralSyncManager;

use crate::error::CliError;

pub async fn run_prune(manager: &CentralSyncManager) -> Result<(), CliError> {
    let removed = manager.prune_lookup().await?;
    println!("Pruned {removed} lookup tombstones");
    Ok(())
}

pub async fn run_close_lapsed(manager: &CentralSyncManager) -> Result<(), CliError> {
    let closed = manager.close_lapsed_sessions().await?;
    println!("Closed {closed} lapsed sessions");
    Ok(())
}
