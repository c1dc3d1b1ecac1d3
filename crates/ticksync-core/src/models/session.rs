//! Sync session model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SyncTick;

/// Lifecycle state of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    SnapshotInProgress,
    SnapshotComplete,
    PersistInProgress,
    Complete,
    Errored,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::SnapshotInProgress => "SNAPSHOT_IN_PROGRESS",
            Self::SnapshotComplete => "SNAPSHOT_COMPLETE",
            Self::PersistInProgress => "PERSIST_IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Errored => "ERRORED",
        }
    }

    /// Whether no further transition is possible
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Created, Self::SnapshotInProgress)
            | (Self::SnapshotInProgress, Self::SnapshotComplete)
            | (Self::SnapshotComplete, Self::PersistInProgress)
            | (Self::PersistInProgress, Self::Complete) => true,
            (current, Self::Errored) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "SNAPSHOT_IN_PROGRESS" => Ok(Self::SnapshotInProgress),
            "SNAPSHOT_COMPLETE" => Ok(Self::SnapshotComplete),
            "PERSIST_IN_PROGRESS" => Ok(Self::PersistInProgress),
            "COMPLETE" => Ok(Self::Complete),
            "ERRORED" => Ok(Self::Errored),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Pull parameters recorded on the session for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParameters {
    #[serde(default)]
    pub is_mobile: bool,
    #[serde(default)]
    pub facility_ids: Vec<String>,
    #[serde(default)]
    pub use_sync_lookup: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables_for_full_resync: Vec<String>,
}

/// What a device asks for when it starts pulling
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Last tick the device has fully pulled
    #[serde(default)]
    pub since: SyncTick,
    #[serde(default)]
    pub tables_to_include: Option<Vec<String>>,
    #[serde(default)]
    pub tables_for_full_resync: Vec<String>,
}

/// Size and upper bound of a staged pull
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMetadata {
    pub total_to_pull: u64,
    pub pull_until: SyncTick,
}

/// One device's sync attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub device_id: Option<String>,
    pub status: SessionStatus,
    /// Unix ms
    pub start_time: i64,
    pub last_connection_time: i64,
    pub snapshot_started_at: Option<i64>,
    pub snapshot_completed_at: Option<i64>,
    pub persist_completed_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub started_at_tick: Option<SyncTick>,
    pub pull_since: Option<SyncTick>,
    pub pull_until: Option<SyncTick>,
    pub errors: Vec<String>,
    pub debug_info: serde_json::Map<String, serde_json::Value>,
    pub parameters: SessionParameters,
}

impl SyncSession {
    /// Whether the session has ended, successfully or not
    pub const fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub const fn is_errored(&self) -> bool {
        matches!(self.status, SessionStatus::Errored)
    }

    /// Most recent recorded error
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}
