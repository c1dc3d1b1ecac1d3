//! Outgoing snapshot strategies.
//!
//! Both strategies stage the rows a device should receive into
//! `sync_snapshots`. The lookup strategy reads the materialized
//! `sync_lookup` table; the tables strategy runs each contract's filter
//! against its entity table.

use libsql::{Connection, Value};
use serde::{Deserialize, Serialize};

use super::MarkedPatients;
use crate::contract::{
    build_snapshot_select, resolve_visibility, EntitySyncContract, FilterShape, SessionConfig,
    SyncRegistry, Visibility,
};
use crate::db::{begin, finish};
use crate::error::Result;
use crate::models::SyncTick;
use crate::util::named_params;

const INSERT_COLUMNS: &str = "session_id, direction, record_type, record_id, is_deleted, \
    updated_at_sync_tick, data, updated_at_by_field_sum";

/// Records newly visible through a full marking are pulled from here
const BEGINNING_OF_TIME: SyncTick = SyncTick::new(-1);

/// Where outgoing rows are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStrategy {
    Lookup,
    Tables,
}

/// Everything that decides what one pull contains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullParams {
    pub session_id: String,
    pub device_id: String,
    pub facility_ids: Vec<String>,
    /// Exclusive lower bound, the device's last pulled tick
    pub since: SyncTick,
    /// Exclusive upper bound
    pub until: SyncTick,
    pub is_mobile: bool,
    /// The facility setting as stored
    pub sync_all_lab_requests: bool,
    /// Restrict the pull to these record types
    pub tables_to_include: Option<Vec<String>>,
    /// Record types to pull again from the beginning
    pub tables_for_full_resync: Vec<String>,
}

impl PullParams {
    /// Filter switches for this pull.
    ///
    /// All lab requests are only sent to non-mobile devices that have
    /// already completed an initial sync.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            is_mobile: self.is_mobile,
            sync_all_lab_requests: self.sync_all_lab_requests
                && !self.is_mobile
                && self.since > SyncTick::ZERO,
        }
    }

    fn since_for(&self, record_type: &str) -> SyncTick {
        if self
            .tables_for_full_resync
            .iter()
            .any(|table| table == record_type)
        {
            BEGINNING_OF_TIME
        } else {
            self.since
        }
    }
}

/// One pass over a record type against one marked patient set
struct Pass<'p> {
    since: SyncTick,
    marked_table: &'p str,
    patient_count: u64,
    config: SessionConfig,
}

pub struct OutgoingSnapshot<'a> {
    conn: &'a Connection,
    registry: &'a SyncRegistry,
}

impl<'a> OutgoingSnapshot<'a> {
    pub const fn new(conn: &'a Connection, registry: &'a SyncRegistry) -> Self {
        Self { conn, registry }
    }

    /// Stage the session's outgoing rows; returns how many were staged
    pub async fn snapshot(&self, params: &PullParams, strategy: SnapshotStrategy) -> Result<u64> {
        let contracts = match &params.tables_to_include {
            Some(tables) => self.registry.resolve_many(tables)?,
            None => self.registry.for_pull(),
        };
        self.registry.resolve_many(&params.tables_for_full_resync)?;

        begin(self.conn).await?;
        let result: Result<u64> = async {
            let marked = MarkedPatients::stage(
                self.conn,
                &params.session_id,
                &params.facility_ids,
                params.since,
            )
            .await?;

            let staged: Result<u64> = async {
                let mut total = 0;
                for contract in contracts.iter().copied() {
                    total += self
                        .snapshot_type(contract.as_ref(), params, &marked, strategy)
                        .await?;
                }
                Ok(total)
            }
            .await;
            let dropped = marked.drop_tables(self.conn).await;
            let total = staged?;
            dropped?;
            Ok(total)
        }
        .await;
        let total = finish(self.conn, result).await?;

        tracing::debug!(
            session_id = %params.session_id,
            ?strategy,
            since = %params.since,
            until = %params.until,
            rows = total,
            "Staged outgoing snapshot"
        );
        Ok(total)
    }

    async fn snapshot_type(
        &self,
        contract: &dyn EntitySyncContract,
        params: &PullParams,
        marked: &MarkedPatients,
        strategy: SnapshotStrategy,
    ) -> Result<u64> {
        let config = params.session_config();
        let mut passes = vec![Pass {
            since: params.since_for(contract.record_type()),
            marked_table: &marked.incremental_table,
            patient_count: marked.incremental_count,
            config,
        }];
        if contract.filter_shape() == Some(FilterShape::Patient) {
            passes.push(Pass {
                since: BEGINNING_OF_TIME,
                marked_table: &marked.full_table,
                patient_count: marked.full_count,
                config: SessionConfig {
                    sync_all_lab_requests: false,
                    ..config
                },
            });
        }

        let mut staged = 0;
        for pass in &passes {
            let visibility = resolve_visibility(
                contract,
                pass.patient_count,
                pass.marked_table,
                &pass.config,
            );
            let sql = match strategy {
                SnapshotStrategy::Lookup => Self::lookup_sql(contract, &visibility, pass),
                SnapshotStrategy::Tables => Self::tables_sql(contract, visibility),
            };
            let Some(sql) = sql else {
                continue;
            };
            staged += self
                .conn
                .execute(
                    &sql,
                    named_params(
                        &sql,
                        vec![
                            (":session_id", Value::Text(params.session_id.clone())),
                            (":device_id", Value::Text(params.device_id.clone())),
                            (
                                ":record_type",
                                Value::Text(contract.record_type().to_string()),
                            ),
                            (
                                ":facility_ids",
                                Value::Text(serde_json::to_string(&params.facility_ids)?),
                            ),
                            (":since", Value::Integer(pass.since.value())),
                            (":until", Value::Integer(params.until.value())),
                        ],
                    ),
                )
                .await?;
        }
        Ok(staged)
    }

    fn lookup_sql(
        contract: &dyn EntitySyncContract,
        visibility: &Visibility,
        pass: &Pass<'_>,
    ) -> Option<String> {
        let scope = match visibility {
            Visibility::Nothing => return None,
            Visibility::Unconditional => String::new(),
            Visibility::Where(_) => match contract.filter_shape() {
                Some(FilterShape::Patient) if pass.config.sync_all_lab_requests => format!(
                    "AND (l.patient_id IN (SELECT patient_id FROM {}) OR l.is_lab_request = 1)",
                    pass.marked_table
                ),
                Some(FilterShape::Patient) => format!(
                    "AND l.patient_id IN (SELECT patient_id FROM {})",
                    pass.marked_table
                ),
                _ => "AND l.facility_id IN (SELECT value FROM json_each(:facility_ids))"
                    .to_string(),
            },
        };

        Some(format!(
            "INSERT INTO sync_snapshots ({INSERT_COLUMNS})
             SELECT :session_id, 'OUTGOING', l.record_type, l.record_id, l.is_deleted,
                    l.updated_at_sync_tick, l.data, l.updated_at_by_field_sum
             FROM sync_lookup l
             WHERE l.record_type = :record_type
               AND l.updated_at_sync_tick > :since
               AND l.updated_at_sync_tick < :until
               AND (l.pushed_by_device_id IS NULL OR l.pushed_by_device_id != :device_id)
               {scope}
               AND NOT EXISTS (
                   SELECT 1 FROM sync_snapshots s
                   WHERE s.session_id = :session_id AND s.direction = 'OUTGOING'
                     AND s.record_type = l.record_type AND s.record_id = l.record_id
               )
             ORDER BY l.updated_at_sync_tick, l.id"
        ))
    }

    fn tables_sql(contract: &dyn EntitySyncContract, visibility: Visibility) -> Option<String> {
        let table = contract.record_type();
        let fragment = match visibility {
            Visibility::Nothing => return None,
            Visibility::Unconditional => format!("WHERE {table}.updated_at_sync_tick > :since"),
            Visibility::Where(fragment) => fragment,
        };

        Some(format!(
            "INSERT INTO sync_snapshots ({INSERT_COLUMNS})
             SELECT :session_id, 'OUTGOING', '{table}', {select}
             FROM {table} {fragment}
               AND {table}.updated_at_sync_tick < :until
               AND NOT EXISTS (
                   SELECT 1 FROM sync_device_ticks d
                   WHERE d.persisted_at_sync_tick = {table}.updated_at_sync_tick
                     AND d.source = 'push' AND d.device_id = :device_id
               )
               AND NOT EXISTS (
                   SELECT 1 FROM sync_snapshots s
                   WHERE s.session_id = :session_id AND s.direction = 'OUTGOING'
                     AND s.record_type = '{table}' AND s.record_id = {table}.id
               )
             ORDER BY {table}.updated_at_sync_tick, {table}.id",
            select = build_snapshot_select(contract)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lab_requests_gate() {
        let mut params = PullParams {
            since: SyncTick::new(10),
            sync_all_lab_requests: true,
            ..PullParams::default()
        };
        assert!(params.session_config().sync_all_lab_requests);

        params.is_mobile = true;
        assert!(!params.session_config().sync_all_lab_requests);

        params.is_mobile = false;
        params.since = SyncTick::ZERO;
        assert!(!params.session_config().sync_all_lab_requests);
    }

    #[test]
    fn test_full_resync_pulls_from_beginning() {
        let params = PullParams {
            since: SyncTick::new(10),
            tables_for_full_resync: vec!["facilities".to_string()],
            ..PullParams::default()
        };
        assert_eq!(params.since_for("facilities"), BEGINNING_OF_TIME);
        assert_eq!(params.since_for("encounters"), SyncTick::new(10));
    }
}
