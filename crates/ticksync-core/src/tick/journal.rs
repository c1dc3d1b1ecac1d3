//! Per-device journal of durably persisted ticks

use libsql::Connection;

use crate::error::Result;
use crate::models::{JournalSource, SyncDeviceTick, SyncTick};

pub struct DeviceTickJournal<'a> {
    conn: &'a Connection,
}

impl<'a> DeviceTickJournal<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append an entry; call only once the work behind `tick` is durable.
    ///
    /// Recording the same entry twice is a no-op.
    pub async fn record(&self, entry: &SyncDeviceTick) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sync_device_ticks (persisted_at_sync_tick, device_id, source)
                 VALUES (?1, ?2, ?3)",
                libsql::params![
                    entry.persisted_at_sync_tick.value(),
                    entry.device_id.as_str(),
                    entry.source.as_str()
                ],
            )
            .await?;
        tracing::debug!(
            device_id = %entry.device_id,
            tick = %entry.persisted_at_sync_tick,
            source = %entry.source,
            "Recorded device tick"
        );
        Ok(())
    }

    /// Highest tick the device has fully received and stored
    pub async fn persisted_at(&self, device_id: &str) -> Result<Option<SyncTick>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(persisted_at_sync_tick) FROM sync_device_ticks
                 WHERE device_id = ?1 AND source = ?2",
                [device_id, JournalSource::Pull.as_str()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(row.get::<Option<i64>>(0)?.map(SyncTick::new))
        } else {
            Ok(None)
        }
    }

    /// Lowest watermark across all devices that have completed a pull.
    ///
    /// Lookup history at or below it has reached every known device.
    pub async fn gc_boundary(&self) -> Result<Option<SyncTick>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MIN(watermark) FROM (
                     SELECT MAX(persisted_at_sync_tick) AS watermark
                     FROM sync_device_ticks
                     WHERE source = ?1
                     GROUP BY device_id
                 )",
                [JournalSource::Pull.as_str()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(row.get::<Option<i64>>(0)?.map(SyncTick::new))
        } else {
            Ok(None)
        }
    }

    /// Entries for a device, newest first
    pub async fn entries(&self, device_id: &str) -> Result<Vec<SyncDeviceTick>> {
        let mut rows = self
            .conn
            .query(
                "SELECT persisted_at_sync_tick, source FROM sync_device_ticks
                 WHERE device_id = ?1
                 ORDER BY persisted_at_sync_tick DESC",
                [device_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let source: String = row.get(1)?;
            entries.push(SyncDeviceTick {
                device_id: device_id.to_string(),
                persisted_at_sync_tick: SyncTick::new(row.get(0)?),
                source: source
                    .parse()
                    .map_err(crate::error::Error::Database)?,
            });
        }
        Ok(entries)
    }
}
