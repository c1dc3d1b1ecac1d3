//! Global sync clock and the write path that stamps it

mod journal;
mod writer;

pub use journal::DeviceTickJournal;
pub use writer::{EntityWrite, EntityWriter};
pub(crate) use writer::store_row;

use libsql::Connection;

use crate::error::{Error, Result};
use crate::models::{SyncTick, TickTock};

const CURRENT_SYNC_TICK_KEY: &str = "currentSyncTick";

/// Reads and advances the global sync tick.
///
/// Advancing must happen inside the caller's write transaction so the new
/// tick commits together with the rows stamped with it.
pub struct TickSequencer<'a> {
    conn: &'a Connection,
}

impl<'a> TickSequencer<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// The most recently assigned tick
    pub async fn current(&self) -> Result<SyncTick> {
        let mut rows = self
            .conn
            .query(
                "SELECT CAST(value AS INTEGER) FROM local_system_facts WHERE key = ?",
                [CURRENT_SYNC_TICK_KEY],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(SyncTick::new(row.get::<i64>(0)?))
        } else {
            Err(Error::Database("sync clock is not initialized".to_string()))
        }
    }

    /// Assign the next tick
    pub async fn next(&self) -> Result<SyncTick> {
        self.advance(1).await
    }

    /// Reserve two ticks at once.
    ///
    /// No row is ever stamped with `tick`, so everything strictly below it
    /// was committed before the reservation.
    pub async fn tick_tock(&self) -> Result<TickTock> {
        let tock = self.advance(2).await?;
        Ok(TickTock {
            tick: SyncTick::new(tock.value() - 1),
            tock,
        })
    }

    async fn advance(&self, step: i64) -> Result<SyncTick> {
        let changed = self
            .conn
            .execute(
                "UPDATE local_system_facts
                 SET value = CAST(CAST(value AS INTEGER) + ?1 AS TEXT)
                 WHERE key = ?2",
                libsql::params![step, CURRENT_SYNC_TICK_KEY],
            )
            .await?;
        if changed == 0 {
            return Err(Error::Database(
                "sync clock is not initialized".to_string(),
            ));
        }
        let tick = self.current().await?;
        tracing::trace!(%tick, "Advanced sync clock");
        Ok(tick)
    }
}
