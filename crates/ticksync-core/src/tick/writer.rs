//! Entity write path that stamps the sync tick in the same transaction

use libsql::params::Params;
use libsql::{Connection, Value};

use super::TickSequencer;
use crate::contract::{EntitySyncContract, SyncRegistry};
use crate::db::{begin, finish};
use crate::error::{Error, Result};
use crate::models::{SyncTick, FIELD_TICKS_KEY};
use crate::util::{json_to_value, now_ms};

/// One row mutation of a registered record type
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub record_type: String,
    pub id: String,
    /// Column values to set; absent columns keep their current value
    pub attributes: serde_json::Value,
    pub deleted: bool,
}

impl EntityWrite {
    pub fn upsert(
        record_type: impl Into<String>,
        id: impl Into<String>,
        attributes: serde_json::Value,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            attributes,
            deleted: false,
        }
    }

    /// Soft delete; the row stays and propagates as a change
    pub fn tombstone(record_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            id: id.into(),
            attributes: serde_json::Value::Object(serde_json::Map::new()),
            deleted: true,
        }
    }
}

/// Writes entity rows, taking each transaction's tick from the sequencer
pub struct EntityWriter<'a> {
    conn: &'a Connection,
    registry: &'a SyncRegistry,
}

impl<'a> EntityWriter<'a> {
    pub const fn new(conn: &'a Connection, registry: &'a SyncRegistry) -> Self {
        Self { conn, registry }
    }

    /// Commit one mutation under a fresh tick
    pub async fn write(&self, write: &EntityWrite) -> Result<SyncTick> {
        self.write_batch(std::slice::from_ref(write)).await
    }

    /// Commit several mutations as one unit of work sharing one tick
    pub async fn write_batch(&self, writes: &[EntityWrite]) -> Result<SyncTick> {
        if writes.is_empty() {
            return Err(Error::InvalidInput("write batch is empty".to_string()));
        }
        for write in writes {
            self.validate(write)?;
        }

        begin(self.conn).await?;
        let result: Result<SyncTick> = async {
            let tick = TickSequencer::new(self.conn).next().await?;
            for write in writes {
                self.apply_at(write, tick).await?;
            }
            Ok(tick)
        }
        .await;
        let tick = finish(self.conn, result).await?;

        tracing::debug!(%tick, rows = writes.len(), "Committed entity writes");
        Ok(tick)
    }

    /// Write a row at a tick the caller already holds, inside the caller's
    /// transaction
    pub async fn apply_at(&self, write: &EntityWrite, tick: SyncTick) -> Result<u64> {
        let contract = self.registry.resolve(&write.record_type)?;
        let attributes = write
            .attributes
            .as_object()
            .ok_or_else(|| Error::InvalidInput("attributes must be a JSON object".to_string()))?;
        store_row(
            self.conn,
            contract.as_ref(),
            &write.id,
            attributes,
            write.deleted,
            tick,
            false,
        )
        .await
    }

    fn validate(&self, write: &EntityWrite) -> Result<()> {
        let contract = self.registry.resolve(&write.record_type)?;
        let attributes = write
            .attributes
            .as_object()
            .ok_or_else(|| Error::InvalidInput("attributes must be a JSON object".to_string()))?;
        if write.id.trim().is_empty() {
            return Err(Error::InvalidInput("record id is empty".to_string()));
        }
        if let Some(unknown) = attributes
            .keys()
            .find(|key| !contract.columns().contains(&key.as_str()))
        {
            return Err(Error::InvalidInput(format!(
                "'{unknown}' is not a column of {}",
                write.record_type
            )));
        }
        Ok(())
    }
}

/// Upsert a row stamped with `tick`.
///
/// Only the contract's columns are taken from `attributes`. With
/// `only_if_newer` an existing row is replaced only by a strictly higher tick,
/// and field ticks carried in the payload are stored as they are.
/// Returns the number of rows changed.
pub(crate) async fn store_row(
    conn: &Connection,
    contract: &dyn EntitySyncContract,
    id: &str,
    attributes: &serde_json::Map<String, serde_json::Value>,
    deleted: bool,
    tick: SyncTick,
    only_if_newer: bool,
) -> Result<u64> {
    let table = contract.record_type();
    let columns: Vec<&str> = contract
        .columns()
        .iter()
        .copied()
        .filter(|column| attributes.contains_key(*column))
        .collect();

    // Pulled rows keep the field ticks they were written with
    let carried = attributes
        .get(FIELD_TICKS_KEY)
        .and_then(serde_json::Value::as_object)
        .filter(|_| only_if_newer);
    let by_field: serde_json::Map<String, serde_json::Value> = carried.cloned().unwrap_or_else(|| {
        columns
            .iter()
            .map(|column| ((*column).to_string(), serde_json::Value::from(tick.value())))
            .collect()
    });

    let mut values = Vec::with_capacity(columns.len() + 4);
    values.push(Value::Text(id.to_string()));
    for column in &columns {
        values.push(attributes.get(*column).map_or(Value::Null, json_to_value));
    }
    values.push(Value::Integer(tick.value()));
    values.push(if deleted {
        Value::Integer(now_ms())
    } else {
        Value::Null
    });
    values.push(Value::Text(serde_json::Value::Object(by_field).to_string()));

    let insert_columns = std::iter::once("id")
        .chain(columns.iter().copied())
        .chain(["updated_at_sync_tick", "deleted_at", "updated_at_by_field"])
        .collect::<Vec<_>>();
    let placeholders = vec!["?"; insert_columns.len()].join(", ");
    let assignments = columns
        .iter()
        .map(|column| format!("{column} = excluded.{column}, "))
        .collect::<String>();
    let field_ticks = if carried.is_some() {
        "excluded.updated_at_by_field".to_string()
    } else {
        format!("json_patch({table}.updated_at_by_field, excluded.updated_at_by_field)")
    };
    let guard = if only_if_newer {
        format!(" WHERE excluded.updated_at_sync_tick > {table}.updated_at_sync_tick")
    } else {
        String::new()
    };

    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})
         ON CONFLICT(id) DO UPDATE SET {assignments}
             updated_at_sync_tick = excluded.updated_at_sync_tick,
             deleted_at = excluded.deleted_at,
             updated_at_by_field = {field_ticks}{guard}",
        insert_columns.join(", ")
    );

    Ok(conn.execute(&sql, Params::Positional(values)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::reference_contracts;
    use crate::db::Database;
    use serde_json::json;

    async fn setup() -> (Database, SyncRegistry) {
        let db = Database::open_in_memory().await.unwrap();
        let registry = SyncRegistry::new(reference_contracts()).unwrap();
        (db, registry)
    }

    async fn row_state(conn: &Connection, id: &str) -> (i64, Option<i64>, String, Option<String>) {
        let mut rows = conn
            .query(
                "SELECT updated_at_sync_tick, deleted_at, updated_at_by_field, reason
                 FROM encounters WHERE id = ?",
                [id],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        (
            row.get(0).unwrap(),
            row.get(1).unwrap(),
            row.get(2).unwrap(),
            row.get(3).unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_stamps_tick_with_row() {
        let (db, registry) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);

        let tick = writer
            .write(&EntityWrite::upsert(
                "encounters",
                "e1",
                json!({"patient_id": "p1", "reason": "checkup"}),
            ))
            .await
            .unwrap();
        assert_eq!(tick, SyncTick::new(1));

        let (row_tick, deleted_at, by_field, reason) = row_state(db.connection(), "e1").await;
        assert_eq!(row_tick, 1);
        assert_eq!(deleted_at, None);
        assert_eq!(reason.as_deref(), Some("checkup"));
        let by_field: serde_json::Value = serde_json::from_str(&by_field).unwrap();
        assert_eq!(by_field, json!({"patient_id": 1, "reason": 1}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_update_merges_field_ticks() {
        let (db, registry) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);

        writer
            .write(&EntityWrite::upsert(
                "encounters",
                "e1",
                json!({"patient_id": "p1", "reason": "checkup"}),
            ))
            .await
            .unwrap();
        let tick = writer
            .write(&EntityWrite::upsert(
                "encounters",
                "e1",
                json!({"reason": "follow-up"}),
            ))
            .await
            .unwrap();
        assert_eq!(tick, SyncTick::new(2));

        let (row_tick, _, by_field, reason) = row_state(db.connection(), "e1").await;
        assert_eq!(row_tick, 2);
        assert_eq!(reason.as_deref(), Some("follow-up"));
        let by_field: serde_json::Value = serde_json::from_str(&by_field).unwrap();
        assert_eq!(by_field, json!({"patient_id": 1, "reason": 2}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_batch_shares_one_tick() {
        let (db, registry) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);

        let tick = writer
            .write_batch(&[
                EntityWrite::upsert("encounters", "e1", json!({"reason": "a"})),
                EntityWrite::upsert("encounters", "e2", json!({"reason": "b"})),
            ])
            .await
            .unwrap();

        assert_eq!(row_state(db.connection(), "e1").await.0, tick.value());
        assert_eq!(row_state(db.connection(), "e2").await.0, tick.value());
        assert_eq!(
            TickSequencer::new(db.connection()).current().await.unwrap(),
            tick
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tombstone_keeps_row() {
        let (db, registry) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);

        writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "a"})))
            .await
            .unwrap();
        let tick = writer
            .write(&EntityWrite::tombstone("encounters", "e1"))
            .await
            .unwrap();

        let (row_tick, deleted_at, _, reason) = row_state(db.connection(), "e1").await;
        assert_eq!(row_tick, tick.value());
        assert!(deleted_at.is_some());
        assert_eq!(reason.as_deref(), Some("a"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_unknown_type_and_column() {
        let (db, registry) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);

        let err = writer
            .write(&EntityWrite::upsert("appointments", "a1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRecordType(_)));

        let err = writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"ward": "3"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // Nothing was stamped for the rejected writes
        assert_eq!(
            TickSequencer::new(db.connection()).current().await.unwrap(),
            SyncTick::ZERO
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_store_row_only_if_newer() {
        let (db, registry) = setup().await;
        let contract = registry.resolve("encounters").unwrap();
        let first = json!({"reason": "newer"});
        let second = json!({"reason": "older"});

        let changed = store_row(
            db.connection(),
            contract.as_ref(),
            "e1",
            first.as_object().unwrap(),
            false,
            SyncTick::new(10),
            true,
        )
        .await
        .unwrap();
        assert_eq!(changed, 1);

        let changed = store_row(
            db.connection(),
            contract.as_ref(),
            "e1",
            second.as_object().unwrap(),
            false,
            SyncTick::new(9),
            true,
        )
        .await
        .unwrap();
        assert_eq!(changed, 0);
        assert_eq!(
            row_state(db.connection(), "e1").await.3.as_deref(),
            Some("newer")
        );
    }
}
