use ticksync_core::CentralSyncManager;

use crate::commands::common::{format_session_lines, session_to_list_item, SessionListItem};
use crate::error::CliError;

pub async fn run_sessions(
    manager: &CentralSyncManager,
    limit: u32,
    as_json: bool,
) -> Result<(), CliError> {
    let sessions = manager.recent_sessions(limit).await?;

    if as_json {
        let json_items = sessions
            .iter()
            .map(session_to_list_item)
            .collect::<Vec<SessionListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sync sessions recorded.");
        return Ok(());
    }

    for line in format_session_lines(&sessions) {
        println!("{line}");
    }
    Ok(())
}
