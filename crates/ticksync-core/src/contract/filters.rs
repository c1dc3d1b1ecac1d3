//! Composable SQL builders for sync filters and lookup selects

use super::EntitySyncContract;
use crate::models::FIELD_TICKS_KEY;

/// Records carrying a `patient_id` of their own
pub fn build_patient_linked_sync_filter(
    table: &str,
    marked_for_sync_patients_table: &str,
) -> String {
    format!(
        "WHERE {table}.patient_id IN (SELECT patient_id FROM {marked_for_sync_patients_table}) \
         AND {table}.updated_at_sync_tick > :since"
    )
}

/// Join each table in `chain` to the next through its `<singular>_id` column.
///
/// `["lab_requests", "encounters"]` joins `encounters` on
/// `lab_requests.encounter_id`.
pub fn build_encounter_linked_sync_filter_joins(chain: &[&str]) -> String {
    chain
        .windows(2)
        .map(|pair| {
            let (from, to) = (pair[0], pair[1]);
            format!(
                "JOIN {to} ON {from}.{}_id = {to}.id",
                to.strip_suffix('s').unwrap_or(to)
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Records reaching a patient through a chain ending at `encounters`
pub fn build_encounter_linked_sync_filter(
    chain: &[&str],
    marked_for_sync_patients_table: &str,
) -> String {
    let (Some(first), Some(last)) = (chain.first(), chain.last()) else {
        return String::new();
    };
    format!(
        "{} WHERE {last}.patient_id IN (SELECT patient_id FROM {marked_for_sync_patients_table}) \
         AND {first}.updated_at_sync_tick > :since",
        build_encounter_linked_sync_filter_joins(chain)
    )
}

/// Records owned by one of the syncing facilities
pub fn build_facility_sync_filter(table: &str) -> String {
    format!(
        "WHERE {table}.facility_id IN (SELECT value FROM json_each(:facility_ids)) \
         AND {table}.updated_at_sync_tick > :since"
    )
}

/// Scoping columns for the lookup tuple, as SQL expressions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupColumns<'a> {
    pub patient_id: Option<&'a str>,
    pub facility_id: Option<&'a str>,
    pub encounter_id: Option<&'a str>,
    pub is_lab_request: bool,
    /// Joined tables whose ticks also count towards the row's tick
    pub parents: &'a [&'a str],
}

/// `json_object(...)` over `id`, the synced columns and their field ticks
fn build_data_object(contract: &dyn EntitySyncContract) -> String {
    let table = contract.record_type();
    let mut pairs = vec![format!("'id', {table}.id")];
    pairs.extend(
        contract
            .columns()
            .iter()
            .map(|column| format!("'{column}', {table}.{column}")),
    );
    pairs.push(format!(
        "'{FIELD_TICKS_KEY}', json({table}.updated_at_by_field)"
    ));
    format!("json_object({})", pairs.join(", "))
}

fn build_field_sum(table: &str) -> String {
    format!("(SELECT SUM(value) FROM json_each({table}.updated_at_by_field))")
}

fn build_updated_at_sync_tick(table: &str, parents: &[&str]) -> String {
    if parents.is_empty() {
        return format!("{table}.updated_at_sync_tick");
    }
    let ticks = std::iter::once(table)
        .chain(parents.iter().copied())
        .map(|source| format!("{source}.updated_at_sync_tick"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("MAX({ticks})")
}

fn build_is_deleted(table: &str) -> String {
    format!("CASE WHEN {table}.deleted_at IS NULL THEN 0 ELSE 1 END")
}

/// Select list producing the lookup tuple, in `sync_lookup` column order:
/// record_id, record_type, is_deleted, updated_at_sync_tick,
/// pushed_by_device_id, data, patient_id, facility_id, encounter_id,
/// is_lab_request, updated_at_by_field_sum.
///
/// `pushed_by_device_id` expects `sync_device_ticks` to be joined by the
/// materializer.
pub fn build_sync_lookup_select(
    contract: &dyn EntitySyncContract,
    columns: LookupColumns<'_>,
) -> String {
    let table = contract.record_type();
    [
        format!("{table}.id"),
        format!("'{table}'"),
        build_is_deleted(table),
        build_updated_at_sync_tick(table, columns.parents),
        "sync_device_ticks.device_id".to_string(),
        build_data_object(contract),
        columns.patient_id.unwrap_or("NULL").to_string(),
        columns.facility_id.unwrap_or("NULL").to_string(),
        columns.encounter_id.unwrap_or("NULL").to_string(),
        if columns.is_lab_request { "1" } else { "0" }.to_string(),
        build_field_sum(table),
    ]
    .join(", ")
}

/// Select list for staging rows straight from the entity table:
/// record_id, is_deleted, updated_at_sync_tick, data, updated_at_by_field_sum.
pub fn build_snapshot_select(contract: &dyn EntitySyncContract) -> String {
    let table = contract.record_type();
    [
        format!("{table}.id"),
        build_is_deleted(table),
        format!("{table}.updated_at_sync_tick"),
        build_data_object(contract),
        build_field_sum(table),
    ]
    .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SyncDirection;
    use pretty_assertions::assert_eq;

    struct Notes;

    impl EntitySyncContract for Notes {
        fn record_type(&self) -> &'static str {
            "notes"
        }
        fn direction(&self) -> SyncDirection {
            SyncDirection::Bidirectional
        }
        fn columns(&self) -> &'static [&'static str] {
            &["body", "encounter_id"]
        }
    }

    #[test]
    fn test_filter_joins_follow_chain() {
        assert_eq!(
            build_encounter_linked_sync_filter_joins(&["lab_tests", "lab_requests", "encounters"]),
            "JOIN lab_requests ON lab_tests.lab_request_id = lab_requests.id \
             JOIN encounters ON lab_requests.encounter_id = encounters.id"
        );
    }

    #[test]
    fn test_encounter_linked_filter() {
        assert_eq!(
            build_encounter_linked_sync_filter(&["notes", "encounters"], "marked_1"),
            "JOIN encounters ON notes.encounter_id = encounters.id \
             WHERE encounters.patient_id IN (SELECT patient_id FROM marked_1) \
             AND notes.updated_at_sync_tick > :since"
        );
    }

    #[test]
    fn test_lookup_select_defaults_to_null_scoping() {
        let select = build_sync_lookup_select(&Notes, LookupColumns::default());
        assert_eq!(
            select,
            "notes.id, 'notes', CASE WHEN notes.deleted_at IS NULL THEN 0 ELSE 1 END, \
             notes.updated_at_sync_tick, sync_device_ticks.device_id, \
             json_object('id', notes.id, 'body', notes.body, 'encounter_id', notes.encounter_id, \
             'updatedAtByField', json(notes.updated_at_by_field)), \
             NULL, NULL, NULL, 0, \
             (SELECT SUM(value) FROM json_each(notes.updated_at_by_field))"
        );
    }
}
