//! Device queue and journal models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SyncTick;

/// A device waiting for its sync turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueuedDevice {
    /// Device identity
    pub id: String,
    pub facility_ids: Vec<String>,
    /// Last heartbeat (Unix ms)
    pub last_seen_time: i64,
    pub last_synced_tick: SyncTick,
    /// Escalates monotonically while queued
    pub urgent: bool,
}

/// Body of a queue admission request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub facility_ids: Vec<String>,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub last_synced_tick: SyncTick,
}

/// What a journal entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalSource {
    /// Central persisted records pushed by the device at this tick
    Push,
    /// The device durably stored everything pulled up to this tick
    Pull,
}

impl JournalSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl fmt::Display for JournalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(format!("unknown journal source '{other}'")),
        }
    }
}

/// Journal entry for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDeviceTick {
    pub device_id: String,
    pub persisted_at_sync_tick: SyncTick,
    pub source: JournalSource,
}
