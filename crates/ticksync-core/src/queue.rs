//! Device sync queue.
//!
//! Admission is a plain read of the queue: no lock is held between the
//! heartbeat upsert and the answer, so two racing devices may both see a
//! result. Ordering is deterministic, which keeps stale answers rare.

use std::time::Duration;

use libsql::{Connection, Row};

use crate::error::Result;
use crate::models::{SyncQueuedDevice, SyncRequest, SyncTick};
use crate::util::{duration_ms, now_ms};

const SELECT_COLUMNS: &str = "id, facility_ids, last_seen_time, last_synced_tick, urgent";

pub struct SyncQueue<'a> {
    conn: &'a Connection,
    freshness: Duration,
}

impl<'a> SyncQueue<'a> {
    /// `freshness` is how long a heartbeat keeps a device eligible
    pub const fn new(conn: &'a Connection, freshness: Duration) -> Self {
        Self { conn, freshness }
    }

    /// Record a heartbeat for `device_id` and return the device whose turn it is
    pub async fn check_sync_request(
        &self,
        device_id: &str,
        request: &SyncRequest,
    ) -> Result<Option<SyncQueuedDevice>> {
        self.check_sync_request_at(device_id, request, now_ms()).await
    }

    pub async fn check_sync_request_at(
        &self,
        device_id: &str,
        request: &SyncRequest,
        now: i64,
    ) -> Result<Option<SyncQueuedDevice>> {
        let facility_ids = serde_json::to_string(&request.facility_ids)?;
        self.conn
            .execute(
                "INSERT INTO sync_queued_devices
                     (id, facility_ids, last_seen_time, last_synced_tick, urgent)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     facility_ids = excluded.facility_ids,
                     last_seen_time = excluded.last_seen_time,
                     last_synced_tick = excluded.last_synced_tick,
                     urgent = MAX(sync_queued_devices.urgent, excluded.urgent)",
                libsql::params![
                    device_id,
                    facility_ids,
                    now,
                    request.last_synced_tick.value(),
                    i64::from(request.urgent)
                ],
            )
            .await?;

        tracing::debug!(device_id, urgent = request.urgent, "Device checked in");
        self.get_next_ready_device_at(now).await
    }

    /// Highest-priority device with a fresh heartbeat.
    ///
    /// Urgent devices go first; among equals the one furthest behind wins.
    pub async fn get_next_ready_device(&self) -> Result<Option<SyncQueuedDevice>> {
        self.get_next_ready_device_at(now_ms()).await
    }

    pub async fn get_next_ready_device_at(&self, now: i64) -> Result<Option<SyncQueuedDevice>> {
        let cutoff = now.saturating_sub(duration_ms(self.freshness));
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_queued_devices
                     WHERE last_seen_time >= ?1
                     ORDER BY urgent DESC, last_synced_tick ASC, id ASC
                     LIMIT 1"
                ),
                [cutoff],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_device(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<SyncQueuedDevice>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM sync_queued_devices WHERE id = ?"),
                [device_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_device(&row)?)),
            None => Ok(None),
        }
    }

    /// Dequeue a device, typically when its session starts
    pub async fn remove(&self, device_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM sync_queued_devices WHERE id = ?", [device_id])
            .await?;
        Ok(removed > 0)
    }

    /// Every queued device in priority order, fresh or not
    pub async fn list(&self) -> Result<Vec<SyncQueuedDevice>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_queued_devices
                     ORDER BY urgent DESC, last_synced_tick ASC, id ASC"
                ),
                (),
            )
            .await?;

        let mut devices = Vec::new();
        while let Some(row) = rows.next().await? {
            devices.push(Self::parse_device(&row)?);
        }
        Ok(devices)
    }

    fn parse_device(row: &Row) -> Result<SyncQueuedDevice> {
        let facility_ids: String = row.get(1)?;
        Ok(SyncQueuedDevice {
            id: row.get(0)?,
            facility_ids: serde_json::from_str(&facility_ids)?,
            last_seen_time: row.get(2)?,
            last_synced_tick: SyncTick::new(row.get(3)?),
            urgent: row.get::<i64>(4)? != 0,
        })
    }
}
