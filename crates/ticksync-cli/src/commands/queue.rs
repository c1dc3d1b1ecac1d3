use ticksync_core::CentralSyncManager;

use crate::commands::common::format_queue_lines;
use crate::error::CliError;

pub async fn run_queue(manager: &CentralSyncManager, as_json: bool) -> Result<(), CliError> {
    let devices = manager.queued_devices().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices queued.");
        return Ok(());
    }

    for line in format_queue_lines(&devices) {
        println!("{line}");
    }
    Ok(())
}
