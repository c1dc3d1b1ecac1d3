//! Sync lookup materialization.
//!
//! Entity rows are copied into `sync_lookup` in tick windows. Every window
//! upserts its rows and records its watermark in one transaction, so a failed
//! window leaves no trace and is recomputed from the same start next time.

mod worker;

pub use worker::MaterializerWorker;

use std::collections::BTreeMap;

use libsql::{Connection, Value};
use serde::Serialize;

use crate::contract::{build_sync_lookup_select, EntitySyncContract, LookupColumns, SyncRegistry};
use crate::db::{begin, finish};
use crate::error::{Error, Result};
use crate::events::{SyncEvent, SyncEvents};
use crate::models::{SyncLookupRow, SyncLookupTick, SyncTick};
use crate::tick::TickSequencer;
use crate::util::{named_params, now_ms};

/// A window that was materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowReport {
    pub record_type: String,
    pub window: SyncLookupTick,
    pub rows: u64,
}

/// A window that failed and will be retried from the same start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowFailure {
    pub record_type: String,
    pub window: SyncLookupTick,
    pub error: String,
}

/// Outcome of one materializer pass over every pulled type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub windows: Vec<WindowReport>,
    pub failures: Vec<WindowFailure>,
}

impl RunReport {
    pub fn rows(&self) -> u64 {
        self.windows.iter().map(|window| window.rows).sum()
    }
}

pub struct LookupMaterializer<'a> {
    conn: &'a Connection,
    registry: &'a SyncRegistry,
    events: &'a SyncEvents,
}

impl<'a> LookupMaterializer<'a> {
    pub const fn new(
        conn: &'a Connection,
        registry: &'a SyncRegistry,
        events: &'a SyncEvents,
    ) -> Self {
        Self {
            conn,
            registry,
            events,
        }
    }

    /// Exclusive upper bound of materialized ticks for a record type
    pub async fn watermark(&self, record_type: &str) -> Result<SyncTick> {
        let mut rows = self
            .conn
            .query(
                "SELECT MAX(lookup_end_tick) FROM sync_lookup_ticks WHERE record_type = ?",
                [record_type],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(row
                .get::<Option<i64>>(0)?
                .map_or(SyncTick::ZERO, SyncTick::new))
        } else {
            Ok(SyncTick::ZERO)
        }
    }

    /// Watermark of every pulled record type
    pub async fn watermarks(&self) -> Result<BTreeMap<String, SyncTick>> {
        let mut watermarks = BTreeMap::new();
        for contract in self.registry.for_pull() {
            let record_type = contract.record_type();
            watermarks.insert(record_type.to_string(), self.watermark(record_type).await?);
        }
        Ok(watermarks)
    }

    /// Materialize every pulled type up to a freshly reserved tick
    pub async fn run(&self) -> Result<RunReport> {
        begin(self.conn).await?;
        let reserved = async { TickSequencer::new(self.conn).tick_tock().await }.await;
        let end = finish(self.conn, reserved).await?.tick;

        let mut report = RunReport::default();
        for contract in self.registry.for_pull() {
            let record_type = contract.record_type();
            let window = SyncLookupTick {
                source_start_tick: self.watermark(record_type).await?,
                lookup_end_tick: end,
            };
            if window.is_empty() {
                continue;
            }
            match self.materialize_window(record_type, window).await {
                Ok(rows) => report.windows.push(WindowReport {
                    record_type: record_type.to_string(),
                    window,
                    rows,
                }),
                Err(error) => {
                    tracing::warn!(
                        record_type,
                        start = %window.source_start_tick,
                        end = %window.lookup_end_tick,
                        "Lookup window failed: {error}"
                    );
                    report.failures.push(WindowFailure {
                        record_type: record_type.to_string(),
                        window,
                        error: error.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            windows = report.windows.len(),
            failures = report.failures.len(),
            rows = report.rows(),
            "Materialized sync lookup up to tick {end}"
        );
        Ok(report)
    }

    /// Upsert lookup rows for `[source_start_tick, lookup_end_tick)` and
    /// advance the watermark, atomically.
    ///
    /// A window may replay ticks at or above the start of the last one, but
    /// must not end below the watermark or start past it.
    pub async fn materialize_window(
        &self,
        record_type: &str,
        window: SyncLookupTick,
    ) -> Result<u64> {
        let contract = self.registry.resolve(record_type)?;
        if !contract.direction().is_pulled() {
            return Err(Error::InvalidInput(format!(
                "{record_type} is not pulled and has no lookup rows"
            )));
        }

        let watermark = self.watermark(record_type).await?;
        if window.lookup_end_tick < watermark {
            return Err(Error::InvalidInput(format!(
                "window for {record_type} ends at {} below watermark {watermark}",
                window.lookup_end_tick
            )));
        }
        if window.source_start_tick > watermark {
            return Err(Error::InvalidInput(format!(
                "window for {record_type} starts at {} past watermark {watermark}",
                window.source_start_tick
            )));
        }
        if window.is_empty() {
            return Ok(0);
        }

        tracing::debug!(
            record_type,
            start = %window.source_start_tick,
            end = %window.lookup_end_tick,
            "Materializing lookup window"
        );

        let sql = build_upsert(contract.as_ref());
        begin(self.conn).await?;
        let result: Result<u64> = async {
            let rows = self
                .conn
                .execute(
                    &sql,
                    named_params(
                        &sql,
                        vec![
                            (":start", Value::Integer(window.source_start_tick.value())),
                            (":end", Value::Integer(window.lookup_end_tick.value())),
                        ],
                    ),
                )
                .await?;
            self.conn
                .execute(
                    "INSERT INTO sync_lookup_ticks
                         (record_type, source_start_tick, lookup_end_tick, completed_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    libsql::params![
                        record_type,
                        window.source_start_tick.value(),
                        window.lookup_end_tick.value(),
                        now_ms()
                    ],
                )
                .await?;
            Ok(rows)
        }
        .await;
        let rows = finish(self.conn, result).await?;

        if window.lookup_end_tick > watermark {
            self.events.publish(SyncEvent::TickAdvanced {
                record_type: record_type.to_string(),
                watermark: window.lookup_end_tick,
            });
        }
        Ok(rows)
    }

    /// Remove deleted lookup rows every device has already received
    pub async fn prune_tombstones(&self, boundary: SyncTick) -> Result<u64> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM sync_lookup WHERE is_deleted = 1 AND updated_at_sync_tick <= ?",
                [boundary.value()],
            )
            .await?;
        tracing::info!(removed, %boundary, "Pruned lookup tombstones");
        Ok(removed)
    }

    /// Materialized rows of a record type, ordered by record id
    pub async fn rows(&self, record_type: &str) -> Result<Vec<SyncLookupRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, record_type, is_deleted, updated_at_sync_tick,
                        pushed_by_device_id, data, patient_id, facility_id, encounter_id,
                        is_lab_request, updated_at_by_field_sum
                 FROM sync_lookup WHERE record_type = ?
                 ORDER BY record_id",
                [record_type],
            )
            .await?;

        let mut lookup_rows = Vec::new();
        while let Some(row) = rows.next().await? {
            lookup_rows.push(SyncLookupRow {
                record_id: row.get(0)?,
                record_type: row.get(1)?,
                is_deleted: row.get::<i64>(2)? != 0,
                updated_at_sync_tick: SyncTick::new(row.get(3)?),
                pushed_by_device_id: row.get(4)?,
                data: row.get(5)?,
                patient_id: row.get(6)?,
                facility_id: row.get(7)?,
                encounter_id: row.get(8)?,
                is_lab_request: row.get::<i64>(9)? != 0,
                updated_at_by_field_sum: row.get(10)?,
            });
        }
        Ok(lookup_rows)
    }
}

fn build_upsert(contract: &dyn EntitySyncContract) -> String {
    let table = contract.record_type();
    let (select, joins, parents) = contract.build_sync_lookup_query_details().map_or_else(
        || {
            let select = build_sync_lookup_select(contract, LookupColumns::default());
            (select, String::new(), Vec::new())
        },
        |details| (details.select, details.joins, details.parents.to_vec()),
    );
    let in_window = std::iter::once(table)
        .chain(parents)
        .map(|source| {
            format!(
                "({source}.updated_at_sync_tick >= :start AND {source}.updated_at_sync_tick < :end)"
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ");

    format!(
        "INSERT INTO sync_lookup (
             record_id, record_type, is_deleted, updated_at_sync_tick, pushed_by_device_id,
             data, patient_id, facility_id, encounter_id, is_lab_request, updated_at_by_field_sum
         )
         SELECT {select}
         FROM {table}
         {joins}
         LEFT JOIN sync_device_ticks
             ON sync_device_ticks.persisted_at_sync_tick = {table}.updated_at_sync_tick
             AND sync_device_ticks.source = 'push'
         WHERE {in_window}
         ON CONFLICT (record_type, record_id) DO UPDATE SET
             is_deleted = excluded.is_deleted,
             updated_at_sync_tick = excluded.updated_at_sync_tick,
             pushed_by_device_id = excluded.pushed_by_device_id,
             data = excluded.data,
             patient_id = excluded.patient_id,
             facility_id = excluded.facility_id,
             encounter_id = excluded.encounter_id,
             is_lab_request = excluded.is_lab_request,
             updated_at_by_field_sum = excluded.updated_at_by_field_sum
         WHERE excluded.updated_at_sync_tick >= sync_lookup.updated_at_sync_tick"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{
        build_patient_linked_sync_filter, reference_contracts, FilterShape, LookupQueryDetails,
        SessionConfig, SyncDirection,
    };
    use crate::db::Database;
    use crate::models::{JournalSource, SyncDeviceTick};
    use crate::tick::{DeviceTickJournal, EntityWrite, EntityWriter};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn window(start: i64, end: i64) -> SyncLookupTick {
        SyncLookupTick {
            source_start_tick: SyncTick::new(start),
            lookup_end_tick: SyncTick::new(end),
        }
    }

    async fn setup() -> (Database, SyncRegistry, SyncEvents) {
        let db = Database::open_in_memory().await.unwrap();
        let registry = SyncRegistry::new(reference_contracts()).unwrap();
        (db, registry, SyncEvents::default())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_materializes_pulled_types() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        writer
            .write(&EntityWrite::upsert(
                "encounters",
                "e1",
                json!({"patient_id": "p1", "facility_id": "f1", "reason": "checkup"}),
            ))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::upsert(
                "access_logs",
                "a1",
                json!({"action": "viewed"}),
            ))
            .await
            .unwrap();

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        let report = materializer.run().await.unwrap();
        assert!(report.failures.is_empty());

        let rows = materializer.rows("encounters").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].patient_id.as_deref(), Some("p1"));
        assert_eq!(rows[0].facility_id.as_deref(), Some("f1"));
        assert_eq!(rows[0].encounter_id.as_deref(), Some("e1"));
        assert_eq!(rows[0].updated_at_sync_tick, SyncTick::new(1));
        assert_eq!(rows[0].updated_at_by_field_sum, Some(3));
        assert_eq!(
            rows[0].attributes().unwrap().get("reason"),
            Some(&json!("checkup"))
        );

        // Push-only types never reach the lookup table
        assert!(materializer.rows("access_logs").await.unwrap().is_empty());

        let watermark = materializer.watermark("encounters").await.unwrap();
        assert_eq!(watermark, SyncTick::new(3));
        assert!(materializer
            .watermarks()
            .await
            .unwrap()
            .values()
            .all(|tick| *tick == watermark));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rerunning_window_is_byte_identical() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        for (id, reason) in [("e1", "a"), ("e2", "b")] {
            writer
                .write(&EntityWrite::upsert(
                    "encounters",
                    id,
                    json!({"patient_id": "p1", "reason": reason}),
                ))
                .await
                .unwrap();
        }

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        materializer
            .materialize_window("encounters", window(0, 3))
            .await
            .unwrap();
        let first = materializer.rows("encounters").await.unwrap();

        materializer
            .materialize_window("encounters", window(0, 3))
            .await
            .unwrap();
        let second = materializer.rows("encounters").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_window_bounds_are_half_open() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        for id in ["e1", "e2", "e3"] {
            writer
                .write(&EntityWrite::upsert("encounters", id, json!({"reason": id})))
                .await
                .unwrap();
        }

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        materializer
            .materialize_window("encounters", window(0, 3))
            .await
            .unwrap();

        let ids: Vec<_> = materializer
            .rows("encounters")
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.record_id)
            .collect();
        assert_eq!(ids, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_window_must_not_skip_or_regress() {
        let (db, registry, events) = setup().await;
        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);

        let err = materializer
            .materialize_window("encounters", window(5, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        materializer
            .materialize_window("encounters", window(0, 9))
            .await
            .unwrap();
        let err = materializer
            .materialize_window("encounters", window(0, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(
            materializer.watermark("encounters").await.unwrap(),
            SyncTick::new(9)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_never_regresses_row() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "old"})))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "new"})))
            .await
            .unwrap();

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        materializer
            .materialize_window("encounters", window(0, 3))
            .await
            .unwrap();

        // Simulate a stale copy arriving through a replayed window
        db.connection()
            .execute(
                "UPDATE encounters SET updated_at_sync_tick = 1, reason = 'stale' WHERE id = 'e1'",
                (),
            )
            .await
            .unwrap();
        materializer
            .materialize_window("encounters", window(0, 3))
            .await
            .unwrap();

        let rows = materializer.rows("encounters").await.unwrap();
        assert_eq!(rows[0].updated_at_sync_tick, SyncTick::new(2));
        assert_eq!(rows[0].attributes().unwrap()["reason"], json!("new"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pushed_by_device_comes_from_journal() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        let tick = writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "pushed"})))
            .await
            .unwrap();
        DeviceTickJournal::new(db.connection())
            .record(&SyncDeviceTick {
                device_id: "tablet-1".to_string(),
                persisted_at_sync_tick: tick,
                source: JournalSource::Push,
            })
            .await
            .unwrap();

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        materializer.run().await.unwrap();

        let rows = materializer.rows("encounters").await.unwrap();
        assert_eq!(rows[0].pushed_by_device_id.as_deref(), Some("tablet-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_advancing_window_publishes_event() {
        let (db, registry, events) = setup().await;
        let mut receiver = events.subscribe();
        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);

        materializer
            .materialize_window("encounters", window(0, 7))
            .await
            .unwrap();

        assert_eq!(
            receiver.try_recv().unwrap(),
            SyncEvent::TickAdvanced {
                record_type: "encounters".to_string(),
                watermark: SyncTick::new(7),
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prune_tombstones_respects_boundary() {
        let (db, registry, events) = setup().await;
        let writer = EntityWriter::new(db.connection(), &registry);
        writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "a"})))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::tombstone("encounters", "e1"))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::upsert("encounters", "e2", json!({"reason": "b"})))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::tombstone("encounters", "e2"))
            .await
            .unwrap();

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        materializer.run().await.unwrap();

        assert_eq!(materializer.prune_tombstones(SyncTick::new(3)).await.unwrap(), 1);
        let ids: Vec<_> = materializer
            .rows("encounters")
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.record_id)
            .collect();
        assert_eq!(ids, vec!["e2".to_string()]);
    }

    /// Fails to materialize rows whose reason is `poison`
    struct PoisonedEncounters;

    impl EntitySyncContract for PoisonedEncounters {
        fn record_type(&self) -> &'static str {
            "encounters"
        }
        fn direction(&self) -> SyncDirection {
            SyncDirection::Bidirectional
        }
        fn columns(&self) -> &'static [&'static str] {
            &["patient_id", "reason"]
        }
        fn filter_shape(&self) -> Option<FilterShape> {
            Some(FilterShape::Patient)
        }
        fn build_patient_sync_filter(
            &self,
            _patient_count: u64,
            marked: &str,
            _session_config: &SessionConfig,
        ) -> Option<String> {
            Some(build_patient_linked_sync_filter("encounters", marked))
        }
        fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
            let select = build_sync_lookup_select(self, LookupColumns::default());
            let select = select.replacen(
                "encounters.id,",
                "CASE WHEN encounters.reason = 'poison' THEN NULL ELSE encounters.id END,",
                1,
            );
            Some(LookupQueryDetails {
                select,
                joins: String::new(),
                parents: &[],
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_window_keeps_watermark_and_retries() {
        let db = Database::open_in_memory().await.unwrap();
        let events = SyncEvents::default();
        let registry = SyncRegistry::new(vec![
            Arc::new(PoisonedEncounters) as Arc<dyn EntitySyncContract>
        ])
        .unwrap();
        let writer = EntityWriter::new(db.connection(), &registry);
        writer
            .write(&EntityWrite::upsert("encounters", "e1", json!({"reason": "fine"})))
            .await
            .unwrap();
        writer
            .write(&EntityWrite::upsert("encounters", "e2", json!({"reason": "poison"})))
            .await
            .unwrap();

        let materializer = LookupMaterializer::new(db.connection(), &registry, &events);
        let report = materializer.run().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].window.source_start_tick,
            SyncTick::ZERO
        );
        assert_eq!(
            materializer.watermark("encounters").await.unwrap(),
            SyncTick::ZERO
        );
        // The good row from the failed window was rolled back too
        assert!(materializer.rows("encounters").await.unwrap().is_empty());

        writer
            .write(&EntityWrite::upsert("encounters", "e2", json!({"reason": "fixed"})))
            .await
            .unwrap();
        let report = materializer.run().await.unwrap();
        assert!(report.failures.is_empty());
        assert_eq!(report.windows[0].window.source_start_tick, SyncTick::ZERO);
        assert_eq!(materializer.rows("encounters").await.unwrap().len(), 2);
    }
}
