//! Sync lookup models

use serde::{Deserialize, Serialize};

use super::SyncTick;
use crate::error::Result;

/// One materialized row per `(record_type, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLookupRow {
    pub record_id: String,
    pub record_type: String,
    pub is_deleted: bool,
    pub updated_at_sync_tick: SyncTick,
    /// Device whose push produced this version, if any
    pub pushed_by_device_id: Option<String>,
    /// Attributes snapshot as stored (JSON object text)
    pub data: String,
    pub patient_id: Option<String>,
    pub facility_id: Option<String>,
    pub encounter_id: Option<String>,
    pub is_lab_request: bool,
    /// Sum of per-field last-write ticks
    pub updated_at_by_field_sum: Option<i64>,
}

impl SyncLookupRow {
    /// Parse the attributes snapshot
    pub fn attributes(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A materialization batch covering `[source_start_tick, lookup_end_tick)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLookupTick {
    pub source_start_tick: SyncTick,
    pub lookup_end_tick: SyncTick,
}

impl SyncLookupTick {
    /// Whether a tick falls inside the window
    #[must_use]
    pub fn contains(&self, tick: SyncTick) -> bool {
        tick >= self.source_start_tick && tick < self.lookup_end_tick
    }

    /// Whether the window covers no ticks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup_end_tick <= self.source_start_tick
    }
}
