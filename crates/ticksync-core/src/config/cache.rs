//! Cached facility settings, invalidated through the event bus

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use libsql::Connection;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::db::{LibSqlSettingsRepository, SettingsRepository};
use crate::error::Result;
use crate::events::{SyncEvent, SyncEvents};

/// Facility setting that widens lab request visibility
pub const SYNC_ALL_LAB_REQUESTS: &str = "syncAllLabRequests";

type CacheKey = (String, String);

/// Read-through cache over the settings table.
///
/// Entries live until `invalidate()` is called, either directly or because a
/// `SettingsChanged` event arrived on the bus.
pub struct SettingsCache {
    values: Mutex<HashMap<CacheKey, Option<serde_json::Value>>>,
    events: Mutex<broadcast::Receiver<SyncEvent>>,
}

impl SettingsCache {
    pub fn new(events: &SyncEvents) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            events: Mutex::new(events.subscribe()),
        }
    }

    /// Drop every cached value
    pub fn invalidate(&self) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Settings cache invalidated");
    }

    /// Read a setting, loading it on a miss
    pub async fn get(
        &self,
        conn: &Connection,
        key: &str,
        facility_id: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        self.drain_events();

        let cache_key = (key.to_string(), facility_id.unwrap_or_default().to_string());
        let cached = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
            .cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        let value = LibSqlSettingsRepository::new(conn)
            .get(key, facility_id)
            .await?;
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, value.clone());
        Ok(value)
    }

    /// Whether any of the facilities has `syncAllLabRequests` turned on
    pub async fn sync_all_lab_requests(
        &self,
        conn: &Connection,
        facility_ids: &[String],
    ) -> Result<bool> {
        for facility_id in facility_ids {
            let value = self
                .get(conn, SYNC_ALL_LAB_REQUESTS, Some(facility_id))
                .await?;
            if value.as_ref().and_then(serde_json::Value::as_bool) == Some(true) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn drain_events(&self) {
        let mut stale = false;
        {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                match events.try_recv() {
                    Ok(SyncEvent::SettingsChanged { .. }) | Err(TryRecvError::Lagged(_)) => {
                        stale = true;
                    }
                    Ok(SyncEvent::TickAdvanced { .. }) => {}
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        if stale {
            self.invalidate();
        }
    }
}
