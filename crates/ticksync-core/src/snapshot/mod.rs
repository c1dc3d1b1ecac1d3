//! Session snapshots: rows staged for a device to pull, and rows a device
//! pushed that await persistence.

mod marked;
mod outgoing;

pub use marked::MarkedPatients;
pub use outgoing::{OutgoingSnapshot, PullParams, SnapshotStrategy};

use libsql::{Connection, Row};

use crate::db::{begin, finish};
use crate::error::{Error, Result};
use crate::models::{IncomingChange, SnapshotDirection, SnapshotRecord, SyncTick};
use crate::util::integer_or_null;

const SELECT_COLUMNS: &str = "id, direction, record_type, record_id, is_deleted, data, \
    updated_at_sync_tick, updated_at_by_field_sum, saved_at_sync_tick";

pub struct SnapshotRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SnapshotRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Outgoing rows with an id above `from_id`, in staging order
    pub async fn outgoing_page(
        &self,
        session_id: &str,
        from_id: i64,
        limit: u32,
    ) -> Result<Vec<SnapshotRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_snapshots
                     WHERE session_id = ?1 AND direction = ?2 AND id > ?3
                     ORDER BY id LIMIT ?4"
                ),
                libsql::params![
                    session_id,
                    SnapshotDirection::Outgoing.as_str(),
                    from_id,
                    i64::from(limit)
                ],
            )
            .await?;
        Self::collect(&mut rows).await
    }

    /// Every incoming row of a session, in push order
    pub async fn incoming(&self, session_id: &str) -> Result<Vec<SnapshotRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM sync_snapshots
                     WHERE session_id = ?1 AND direction = ?2
                     ORDER BY id"
                ),
                [session_id, SnapshotDirection::Incoming.as_str()],
            )
            .await?;
        Self::collect(&mut rows).await
    }

    pub async fn count(&self, session_id: &str, direction: SnapshotDirection) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM sync_snapshots WHERE session_id = ?1 AND direction = ?2",
                [session_id, direction.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(u64::try_from(row.get::<i64>(0)?).unwrap_or_default()),
            None => Ok(0),
        }
    }

    /// Stage pushed records for later persistence
    pub async fn stage_incoming(
        &self,
        session_id: &str,
        changes: &[IncomingChange],
    ) -> Result<u64> {
        for change in changes {
            if change.record_id.trim().is_empty() {
                return Err(Error::InvalidInput(format!(
                    "pushed {} record has no id",
                    change.record_type
                )));
            }
        }

        begin(self.conn).await?;
        let result: Result<u64> = async {
            let mut staged = 0;
            for change in changes {
                staged += self
                    .conn
                    .execute(
                        "INSERT INTO sync_snapshots
                             (session_id, direction, record_type, record_id, is_deleted, data,
                              updated_at_by_field_sum)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        libsql::params![
                            session_id,
                            SnapshotDirection::Incoming.as_str(),
                            change.record_type.as_str(),
                            change.record_id.as_str(),
                            i64::from(change.is_deleted),
                            serde_json::to_string(&change.data)?,
                            integer_or_null(change.updated_at_by_field_sum())
                        ],
                    )
                    .await?;
            }
            Ok(staged)
        }
        .await;
        finish(self.conn, result).await
    }

    /// Stamp the tick incoming rows were persisted at
    pub async fn mark_saved(&self, session_id: &str, tick: SyncTick) -> Result<u64> {
        Ok(self
            .conn
            .execute(
                "UPDATE sync_snapshots SET saved_at_sync_tick = ?1
                 WHERE session_id = ?2 AND direction = ?3 AND saved_at_sync_tick IS NULL",
                libsql::params![
                    tick.value(),
                    session_id,
                    SnapshotDirection::Incoming.as_str()
                ],
            )
            .await?)
    }

    /// Drop every staged row of a session
    pub async fn clear(&self, session_id: &str) -> Result<u64> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_snapshots WHERE session_id = ?", [session_id])
            .await?)
    }

    async fn collect(rows: &mut libsql::Rows) -> Result<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    fn parse_record(row: &Row) -> Result<SnapshotRecord> {
        let direction: String = row.get(1)?;
        let data: String = row.get(5)?;
        Ok(SnapshotRecord {
            id: row.get(0)?,
            direction: direction.parse().map_err(Error::Database)?,
            record_type: row.get(2)?,
            record_id: row.get(3)?,
            is_deleted: row.get::<i64>(4)? != 0,
            data: serde_json::from_str(&data)?,
            updated_at_sync_tick: SyncTick::new(row.get(6)?),
            updated_at_by_field_sum: row.get(7)?,
            saved_at_sync_tick: row.get::<Option<i64>>(8)?.map(SyncTick::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::SessionParameters;
    use crate::session::SyncSessions;
    use serde_json::json;
    use std::time::Duration;

    async fn session(db: &Database) -> String {
        SyncSessions::new(db.connection(), Duration::from_secs(600))
            .create(Some("d1"), &SessionParameters::default())
            .await
            .unwrap()
            .id
    }

    fn change(record_id: &str, data: serde_json::Value) -> IncomingChange {
        IncomingChange {
            record_type: "encounters".to_string(),
            record_id: record_id.to_string(),
            is_deleted: false,
            data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stage_and_mark_incoming() {
        let db = Database::open_in_memory().await.unwrap();
        let session_id = session(&db).await;
        let repo = SnapshotRepository::new(db.connection());

        let staged = repo
            .stage_incoming(
                &session_id,
                &[
                    change("e1", json!({"reason": "a", "updatedAtByField": {"reason": 4}})),
                    change("e2", json!({"reason": "b"})),
                ],
            )
            .await
            .unwrap();
        assert_eq!(staged, 2);
        assert_eq!(
            repo.count(&session_id, SnapshotDirection::Incoming)
                .await
                .unwrap(),
            2
        );

        assert_eq!(repo.mark_saved(&session_id, SyncTick::new(9)).await.unwrap(), 2);
        let incoming = repo.incoming(&session_id).await.unwrap();
        assert_eq!(incoming[0].record_id, "e1");
        assert_eq!(incoming[0].updated_at_by_field_sum, Some(4));
        assert_eq!(incoming[1].updated_at_by_field_sum, None);
        assert!(incoming
            .iter()
            .all(|record| record.saved_at_sync_tick == Some(SyncTick::new(9))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_record_without_id() {
        let db = Database::open_in_memory().await.unwrap();
        let session_id = session(&db).await;
        let repo = SnapshotRepository::new(db.connection());

        let err = repo
            .stage_incoming(&session_id, &[change(" ", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(
            repo.count(&session_id, SnapshotDirection::Incoming)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_outgoing_pages_by_id() {
        let db = Database::open_in_memory().await.unwrap();
        let session_id = session(&db).await;
        for record_id in ["a", "b", "c"] {
            db.connection()
                .execute(
                    "INSERT INTO sync_snapshots (session_id, direction, record_type, record_id)
                     VALUES (?1, 'OUTGOING', 'facilities', ?2)",
                    [session_id.as_str(), record_id],
                )
                .await
                .unwrap();
        }
        let repo = SnapshotRepository::new(db.connection());

        let first = repo.outgoing_page(&session_id, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = repo
            .outgoing_page(&session_id, first[1].id, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].record_id, "c");

        assert_eq!(repo.clear(&session_id).await.unwrap(), 3);
    }
}
