//! Reference record types exercised by the engine

use std::sync::Arc;

use super::filters::{
    build_encounter_linked_sync_filter, build_encounter_linked_sync_filter_joins,
    build_facility_sync_filter, build_patient_linked_sync_filter, build_sync_lookup_select,
    LookupColumns,
};
use super::{EntitySyncContract, FilterShape, LookupQueryDetails, SessionConfig, SyncDirection};

/// Every reference contract, in registration order
pub fn reference_contracts() -> Vec<Arc<dyn EntitySyncContract>> {
    vec![
        Arc::new(Facilities),
        Arc::new(Patients),
        Arc::new(PatientFacilities),
        Arc::new(Encounters),
        Arc::new(LabRequests),
        Arc::new(AccessLogs),
        Arc::new(LocalNotes),
    ]
}

struct Facilities;

impl EntitySyncContract for Facilities {
    fn record_type(&self) -> &'static str {
        "facilities"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::PullFromCentral
    }

    fn columns(&self) -> &'static [&'static str] {
        &["code", "name"]
    }

    fn filter_shape(&self) -> Option<FilterShape> {
        Some(FilterShape::Global)
    }

    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        Some(LookupQueryDetails {
            select: build_sync_lookup_select(
                self,
                LookupColumns {
                    facility_id: Some("facilities.id"),
                    ..LookupColumns::default()
                },
            ),
            joins: String::new(),
            parents: &[],
        })
    }
}

/// Patient demographics sync everywhere
struct Patients;

impl EntitySyncContract for Patients {
    fn record_type(&self) -> &'static str {
        "patients"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn columns(&self) -> &'static [&'static str] {
        &["display_id", "first_name", "last_name", "date_of_birth"]
    }

    fn filter_shape(&self) -> Option<FilterShape> {
        Some(FilterShape::Global)
    }

    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        Some(LookupQueryDetails {
            select: build_sync_lookup_select(
                self,
                LookupColumns {
                    patient_id: Some("patients.id"),
                    ..LookupColumns::default()
                },
            ),
            joins: String::new(),
            parents: &[],
        })
    }
}

/// Marks a patient for sync at a facility
struct PatientFacilities;

impl EntitySyncContract for PatientFacilities {
    fn record_type(&self) -> &'static str {
        "patient_facilities"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn columns(&self) -> &'static [&'static str] {
        &["patient_id", "facility_id"]
    }

    fn filter_shape(&self) -> Option<FilterShape> {
        Some(FilterShape::Global)
    }

    fn build_sync_filter(&self) -> Option<String> {
        Some(build_facility_sync_filter(self.record_type()))
    }

    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        Some(LookupQueryDetails {
            select: build_sync_lookup_select(
                self,
                LookupColumns {
                    patient_id: Some("patient_facilities.patient_id"),
                    facility_id: Some("patient_facilities.facility_id"),
                    ..LookupColumns::default()
                },
            ),
            joins: String::new(),
            parents: &[],
        })
    }
}

struct Encounters;

impl EntitySyncContract for Encounters {
    fn record_type(&self) -> &'static str {
        "encounters"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn columns(&self) -> &'static [&'static str] {
        &["patient_id", "facility_id", "reason", "start_date"]
    }

    fn filter_shape(&self) -> Option<FilterShape> {
        Some(FilterShape::Patient)
    }

    fn build_patient_sync_filter(
        &self,
        patient_count: u64,
        marked_for_sync_patients_table: &str,
        _session_config: &SessionConfig,
    ) -> Option<String> {
        if patient_count == 0 {
            return None;
        }
        Some(build_patient_linked_sync_filter(
            self.record_type(),
            marked_for_sync_patients_table,
        ))
    }

    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        Some(LookupQueryDetails {
            select: build_sync_lookup_select(
                self,
                LookupColumns {
                    patient_id: Some("encounters.patient_id"),
                    facility_id: Some("encounters.facility_id"),
                    encounter_id: Some("encounters.id"),
                    is_lab_request: false,
                    parents: &[],
                },
            ),
            joins: String::new(),
            parents: &[],
        })
    }
}

struct LabRequests;

const LAB_REQUEST_PARENTS: &[&str] = &["encounters"];

impl EntitySyncContract for LabRequests {
    fn record_type(&self) -> &'static str {
        "lab_requests"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Bidirectional
    }

    fn columns(&self) -> &'static [&'static str] {
        &["encounter_id", "status", "display_id"]
    }

    fn filter_shape(&self) -> Option<FilterShape> {
        Some(FilterShape::Patient)
    }

    fn build_patient_sync_filter(
        &self,
        patient_count: u64,
        marked_for_sync_patients_table: &str,
        session_config: &SessionConfig,
    ) -> Option<String> {
        if session_config.sync_all_lab_requests {
            return Some("WHERE lab_requests.updated_at_sync_tick > :since".to_string());
        }
        if patient_count == 0 {
            return None;
        }
        Some(build_encounter_linked_sync_filter(
            &[self.record_type(), "encounters"],
            marked_for_sync_patients_table,
        ))
    }

    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        Some(LookupQueryDetails {
            select: build_sync_lookup_select(
                self,
                LookupColumns {
                    patient_id: Some("encounters.patient_id"),
                    facility_id: Some("encounters.facility_id"),
                    encounter_id: Some("encounters.id"),
                    is_lab_request: true,
                    parents: LAB_REQUEST_PARENTS,
                },
            ),
            joins: build_encounter_linked_sync_filter_joins(&[self.record_type(), "encounters"]),
            parents: LAB_REQUEST_PARENTS,
        })
    }
}

/// Audit trail recorded on devices and collected centrally
struct AccessLogs;

impl EntitySyncContract for AccessLogs {
    fn record_type(&self) -> &'static str {
        "access_logs"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::PushToCentral
    }

    fn columns(&self) -> &'static [&'static str] {
        &["patient_id", "facility_id", "device_id", "action", "logged_at"]
    }
}

struct LocalNotes;

impl EntitySyncContract for LocalNotes {
    fn record_type(&self) -> &'static str {
        "local_notes"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::DoNotSync
    }

    fn columns(&self) -> &'static [&'static str] {
        &["body"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{resolve_visibility, Visibility};

    #[test]
    fn test_lab_requests_follow_encounter_patient() {
        let visibility =
            resolve_visibility(&LabRequests, 2, "marked", &SessionConfig::default());
        let Visibility::Where(fragment) = visibility else {
            panic!("expected fragment");
        };
        assert!(fragment.starts_with("JOIN encounters ON lab_requests.encounter_id = encounters.id"));
        assert!(fragment.contains("encounters.patient_id IN (SELECT patient_id FROM marked)"));
    }

    #[test]
    fn test_sync_all_lab_requests_ignores_patient_count() {
        let config = SessionConfig {
            is_mobile: false,
            sync_all_lab_requests: true,
        };
        assert_eq!(
            resolve_visibility(&LabRequests, 0, "marked", &config),
            Visibility::Where("WHERE lab_requests.updated_at_sync_tick > :since".to_string())
        );
        assert_eq!(
            resolve_visibility(&Encounters, 0, "marked", &config),
            Visibility::Nothing
        );
    }

    #[test]
    fn test_lab_request_lookup_flags_rows() {
        let details = LabRequests.build_sync_lookup_query_details().unwrap();
        assert!(details.select.contains("encounters.id, 1, (SELECT SUM"));
        assert_eq!(
            details.joins,
            "JOIN encounters ON lab_requests.encounter_id = encounters.id"
        );
    }

    #[test]
    fn test_patients_visible_everywhere() {
        assert_eq!(
            resolve_visibility(&Patients, 0, "marked", &SessionConfig::default()),
            Visibility::Unconditional
        );
    }
}
