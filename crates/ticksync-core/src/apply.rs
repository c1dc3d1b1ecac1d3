//! Receiving side of a pull: write pulled records into local tables

use libsql::Connection;
use serde::Serialize;

use crate::contract::SyncRegistry;
use crate::db::{begin, finish};
use crate::error::Result;
use crate::models::SnapshotRecord;
use crate::tick::store_row;

/// Same tick on both sides but different field histories
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrentEdit {
    pub record_type: String,
    pub record_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: u64,
    /// Local copy was at the same or a newer tick
    pub skipped: u64,
    pub concurrent_edits: Vec<ConcurrentEdit>,
}

/// Applies pulled records by idempotent upsert keyed on `id`.
///
/// The incoming tick is kept, and a record only replaces a local row with a
/// strictly lower tick, so duplicate or out-of-order delivery is a no-op.
pub struct IncomingApplier<'a> {
    conn: &'a Connection,
    registry: &'a SyncRegistry,
}

impl<'a> IncomingApplier<'a> {
    pub const fn new(conn: &'a Connection, registry: &'a SyncRegistry) -> Self {
        Self { conn, registry }
    }

    pub async fn apply_incoming(&self, records: &[SnapshotRecord]) -> Result<ApplyReport> {
        for record in records {
            self.registry.resolve(&record.record_type)?;
        }

        begin(self.conn).await?;
        let result: Result<ApplyReport> = async {
            let mut report = ApplyReport::default();
            for record in records {
                let contract = self.registry.resolve(&record.record_type)?;
                let local = self.local_state(contract.record_type(), &record.record_id).await?;

                let changed = store_row(
                    self.conn,
                    contract.as_ref(),
                    &record.record_id,
                    &record.data,
                    record.is_deleted,
                    record.updated_at_sync_tick,
                    true,
                )
                .await?;

                if changed > 0 {
                    report.applied += 1;
                    continue;
                }
                report.skipped += 1;
                if let Some((tick, fingerprint)) = local {
                    if tick == record.updated_at_sync_tick.value()
                        && fingerprint.is_some()
                        && record.updated_at_by_field_sum.is_some()
                        && fingerprint != record.updated_at_by_field_sum
                    {
                        report.concurrent_edits.push(ConcurrentEdit {
                            record_type: record.record_type.clone(),
                            record_id: record.record_id.clone(),
                        });
                    }
                }
            }
            Ok(report)
        }
        .await;
        let report = finish(self.conn, result).await?;

        if !report.concurrent_edits.is_empty() {
            tracing::warn!(
                count = report.concurrent_edits.len(),
                "Pulled records conflict with local edits at the same tick"
            );
        }
        tracing::debug!(
            applied = report.applied,
            skipped = report.skipped,
            "Applied pulled records"
        );
        Ok(report)
    }

    async fn local_state(&self, table: &str, id: &str) -> Result<Option<(i64, Option<i64>)>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT updated_at_sync_tick,
                            (SELECT SUM(value) FROM json_each({table}.updated_at_by_field))
                     FROM {table} WHERE id = ?"
                ),
                [id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }
}
