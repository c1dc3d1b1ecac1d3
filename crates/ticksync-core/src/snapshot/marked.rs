//! Per-session temp tables of patients marked for sync

use libsql::{Connection, Value};

use crate::error::Result;
use crate::models::SyncTick;
use crate::util::named_params;

/// Two disjoint patient sets staged for one session.
///
/// `full` holds patients marked at the facilities after `since`; their
/// records are pulled from the beginning of time. `incremental` holds the
/// rest, whose records are pulled from `since`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkedPatients {
    pub full_table: String,
    pub full_count: u64,
    pub incremental_table: String,
    pub incremental_count: u64,
}

impl MarkedPatients {
    /// Temp table names for a session; ids become SQL identifiers
    pub fn table_names(session_id: &str) -> (String, String) {
        let suffix: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        (
            format!("marked_full_{suffix}"),
            format!("marked_incremental_{suffix}"),
        )
    }

    /// Build both tables from the facilities' patient markings
    pub async fn stage(
        conn: &Connection,
        session_id: &str,
        facility_ids: &[String],
        since: SyncTick,
    ) -> Result<Self> {
        let (full_table, incremental_table) = Self::table_names(session_id);
        let facility_ids = serde_json::to_string(facility_ids)?;

        for table in [&full_table, &incremental_table] {
            conn.execute(&format!("DROP TABLE IF EXISTS temp.{table}"), ())
                .await?;
            conn.execute(
                &format!("CREATE TEMP TABLE {table} (patient_id TEXT PRIMARY KEY)"),
                (),
            )
            .await?;
        }

        let full_sql = format!(
            "INSERT OR IGNORE INTO {full_table} (patient_id)
             SELECT patient_id FROM patient_facilities
             WHERE deleted_at IS NULL
               AND facility_id IN (SELECT value FROM json_each(:facility_ids))
               AND updated_at_sync_tick > :since"
        );
        let full_count = conn
            .execute(
                &full_sql,
                named_params(
                    &full_sql,
                    vec![
                        (":facility_ids", Value::Text(facility_ids.clone())),
                        (":since", Value::Integer(since.value())),
                    ],
                ),
            )
            .await?;

        let incremental_sql = format!(
            "INSERT OR IGNORE INTO {incremental_table} (patient_id)
             SELECT patient_id FROM patient_facilities
             WHERE deleted_at IS NULL
               AND facility_id IN (SELECT value FROM json_each(:facility_ids))
               AND updated_at_sync_tick <= :since
               AND patient_id NOT IN (SELECT patient_id FROM {full_table})"
        );
        let incremental_count = conn
            .execute(
                &incremental_sql,
                named_params(
                    &incremental_sql,
                    vec![
                        (":facility_ids", Value::Text(facility_ids)),
                        (":since", Value::Integer(since.value())),
                    ],
                ),
            )
            .await?;

        tracing::debug!(
            session_id,
            full = full_count,
            incremental = incremental_count,
            "Staged marked patients"
        );
        Ok(Self {
            full_table,
            full_count,
            incremental_table,
            incremental_count,
        })
    }

    pub async fn drop_tables(&self, conn: &Connection) -> Result<()> {
        for table in [&self.full_table, &self.incremental_table] {
            conn.execute(&format!("DROP TABLE IF EXISTS temp.{table}"), ())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{reference_contracts, SyncRegistry};
    use crate::db::Database;
    use crate::tick::{EntityWrite, EntityWriter};
    use serde_json::json;

    async fn count(conn: &Connection, table: &str) -> i64 {
        let mut rows = conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), ())
            .await
            .unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    #[test]
    fn test_table_names_are_identifiers() {
        let (full, incremental) = MarkedPatients::table_names("0192-AB-cd");
        assert_eq!(full, "marked_full_0192_ab_cd");
        assert_eq!(incremental, "marked_incremental_0192_ab_cd");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sets_are_disjoint() {
        let db = Database::open_in_memory().await.unwrap();
        let registry = SyncRegistry::new(reference_contracts()).unwrap();
        let writer = EntityWriter::new(db.connection(), &registry);

        let mark = |id: &str, patient: &str, facility: &str| {
            EntityWrite::upsert(
                "patient_facilities",
                id,
                json!({"patient_id": patient, "facility_id": facility}),
            )
        };
        // Tick 1: p1 at f1, p3 at f2
        writer
            .write_batch(&[mark("pf1", "p1", "f1"), mark("pf3", "p3", "f2")])
            .await
            .unwrap();
        // Tick 2: p2 at f1, p1 again through a second marking
        writer
            .write_batch(&[mark("pf2", "p2", "f1"), mark("pf4", "p1", "f1")])
            .await
            .unwrap();

        let marked = MarkedPatients::stage(
            db.connection(),
            "s-1",
            &["f1".to_string()],
            SyncTick::new(1),
        )
        .await
        .unwrap();

        assert_eq!(marked.full_count, 2);
        assert_eq!(marked.incremental_count, 0);
        assert_eq!(count(db.connection(), &marked.full_table).await, 2);

        let marked = MarkedPatients::stage(
            db.connection(),
            "s-2",
            &["f1".to_string(), "f2".to_string()],
            SyncTick::new(1),
        )
        .await
        .unwrap();
        // p1 was re-marked after `since`, so it is only in the full set
        assert_eq!(marked.full_count, 2);
        assert_eq!(marked.incremental_count, 1);

        marked.drop_tables(db.connection()).await.unwrap();
        assert!(db
            .connection()
            .query(&format!("SELECT * FROM {}", marked.full_table), ())
            .await
            .is_err());
    }
}
