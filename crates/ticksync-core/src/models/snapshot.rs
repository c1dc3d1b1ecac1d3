//! Session snapshot models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SyncTick;

/// Payload key carrying each column's last-written tick
pub const FIELD_TICKS_KEY: &str = "updatedAtByField";

/// Which way a staged record travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotDirection {
    /// Central to device
    Outgoing,
    /// Device to central
    Incoming,
}

impl SnapshotDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "OUTGOING",
            Self::Incoming => "INCOMING",
        }
    }
}

impl fmt::Display for SnapshotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUTGOING" => Ok(Self::Outgoing),
            "INCOMING" => Ok(Self::Incoming),
            other => Err(format!("unknown snapshot direction '{other}'")),
        }
    }
}

/// A staged record in a session snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: i64,
    pub direction: SnapshotDirection,
    pub record_type: String,
    pub record_id: String,
    pub is_deleted: bool,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub updated_at_sync_tick: SyncTick,
    pub updated_at_by_field_sum: Option<i64>,
    pub saved_at_sync_tick: Option<SyncTick>,
}

/// A record pushed by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingChange {
    pub record_type: String,
    pub record_id: String,
    #[serde(default)]
    pub is_deleted: bool,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl IncomingChange {
    /// Sum of the `updatedAtByField` ticks carried in the payload, if any
    pub fn updated_at_by_field_sum(&self) -> Option<i64> {
        let fields = self.data.get(FIELD_TICKS_KEY)?.as_object()?;
        Some(fields.values().filter_map(serde_json::Value::as_i64).sum())
    }
}
