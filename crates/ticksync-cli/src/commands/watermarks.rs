use std::collections::BTreeMap;

use ticksync_core::{CentralSyncManager, SyncTick};

use crate::error::CliError;

pub async fn run_watermarks(manager: &CentralSyncManager, as_json: bool) -> Result<(), CliError> {
    let watermarks = manager.watermarks().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&watermarks)?);
        return Ok(());
    }

    let current = manager.current_tick().await?;
    for line in format_watermark_lines(&watermarks, current) {
        println!("{line}");
    }
    Ok(())
}

/// One line per record type with how far it trails the clock
pub fn format_watermark_lines(
    watermarks: &BTreeMap<String, SyncTick>,
    current: SyncTick,
) -> Vec<String> {
    let mut lines: Vec<String> = watermarks
        .iter()
        .map(|(record_type, watermark)| {
            let behind = current.value().saturating_sub(watermark.value()).max(0);
            format!("{record_type:<20} {:>10}  behind={behind}", watermark.value())
        })
        .collect();
    lines.push(format!("current tick: {current}"));
    lines
}
