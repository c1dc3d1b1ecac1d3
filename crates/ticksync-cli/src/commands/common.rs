use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;
use ticksync_core::config::SyncConfig;
use ticksync_core::contract::{reference_contracts, SyncRegistry};
use ticksync_core::models::{SyncQueuedDevice, SyncSession};
use ticksync_core::CentralSyncManager;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SessionListItem {
    pub id: String,
    pub device_id: Option<String>,
    pub status: String,
    pub start_time: i64,
    pub started_at_tick: Option<i64>,
    pub pull_since: Option<i64>,
    pub pull_until: Option<i64>,
    pub last_error: Option<String>,
}

pub fn session_to_list_item(session: &SyncSession) -> SessionListItem {
    SessionListItem {
        id: session.id.clone(),
        device_id: session.device_id.clone(),
        status: session.status.to_string(),
        start_time: session.start_time,
        started_at_tick: session.started_at_tick.map(|tick| tick.value()),
        pull_since: session.pull_since.map(|tick| tick.value()),
        pull_until: session.pull_until.map(|tick| tick.value()),
        last_error: session.last_error().map(str::to_string),
    }
}

pub fn format_session_lines(sessions: &[SyncSession]) -> Vec<String> {
    sessions
        .iter()
        .map(|session| {
            let window = match (session.pull_since, session.pull_until) {
                (Some(since), Some(until)) => format!("  pull=({since}, {until})"),
                _ => String::new(),
            };
            let error = session
                .last_error()
                .map(|error| format!("  error={error}"))
                .unwrap_or_default();
            format!(
                "{}  {}  {:<20}  device={}{window}{error}",
                format_timestamp(session.start_time),
                session.id,
                session.status.as_str(),
                session.device_id.as_deref().unwrap_or("-"),
            )
        })
        .collect()
}

pub fn format_queue_lines(devices: &[SyncQueuedDevice]) -> Vec<String> {
    devices
        .iter()
        .map(|device| {
            format!(
                "{}  {}{}  last_synced={}  facilities={}",
                format_timestamp(device.last_seen_time),
                device.id,
                if device.urgent { "  [urgent]" } else { "" },
                device.last_synced_tick,
                device.facility_ids.join(",")
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match cli_db_path.or_else(|| env::var_os("TICKSYNC_DB_PATH").map(PathBuf::from)) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("ticksync").join("central.db"))
        .ok_or_else(|| CliError::Config("could not resolve a data directory".to_string()))
}

pub async fn open_manager(path: &Path) -> Result<CentralSyncManager, CliError> {
    let config = SyncConfig::from_env().map_err(ticksync_core::Error::from)?;
    open_manager_with(path, config).await
}

pub async fn open_manager_with(
    path: &Path,
    config: SyncConfig,
) -> Result<CentralSyncManager, CliError> {
    let registry = SyncRegistry::new(reference_contracts()).map_err(ticksync_core::Error::from)?;
    Ok(CentralSyncManager::open_path(path, registry, config).await?)
}
