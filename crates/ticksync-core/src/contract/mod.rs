//! Per-entity sync contracts.
//!
//! Each syncing record type declares which way its rows travel and how to
//! decide which rows a facility may see. Visibility is compiled to SQL
//! fragments so it can be evaluated by the database.

mod entities;
mod filters;
mod registry;

pub use entities::reference_contracts;
pub use filters::{
    build_encounter_linked_sync_filter, build_encounter_linked_sync_filter_joins,
    build_facility_sync_filter, build_patient_linked_sync_filter, build_snapshot_select,
    build_sync_lookup_select, LookupColumns,
};
pub use registry::SyncRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which way a record type travels between devices and central
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    Bidirectional,
    /// Facility to central only
    PushToCentral,
    /// Central to facility only
    PullFromCentral,
    /// Never leaves the device
    DoNotSync,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bidirectional => "BIDIRECTIONAL",
            Self::PushToCentral => "PUSH_TO_CENTRAL",
            Self::PullFromCentral => "PULL_FROM_CENTRAL",
            Self::DoNotSync => "DO_NOT_SYNC",
        }
    }

    /// Rows of this type are sent to devices
    pub const fn is_pulled(self) -> bool {
        matches!(self, Self::Bidirectional | Self::PullFromCentral)
    }

    /// Rows of this type are accepted from devices
    pub const fn is_pushed(self) -> bool {
        matches!(self, Self::Bidirectional | Self::PushToCentral)
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which filter builder a contract supplies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterShape {
    /// `build_sync_filter`: independent of the marked patient set.
    ///
    /// A fragment, if any, must be `build_facility_sync_filter` over the
    /// record's table; lookup pulls scope by the materialized `facility_id`.
    Global,
    /// `build_patient_sync_filter`: follows the marked patient set
    Patient,
}

/// Per-session switches passed to patient filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub is_mobile: bool,
    pub sync_all_lab_requests: bool,
}

/// Custom lookup materialization for a record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQueryDetails {
    /// Select list producing the lookup tuple
    pub select: String,
    /// Joins needed by `select`
    pub joins: String,
    /// Joined tables whose changes re-materialize the row
    pub parents: &'static [&'static str],
}

/// Sync behavior of one record type.
///
/// Filter fragments are `[JOIN ...] WHERE ...` text over the record's own
/// table and may reference `:since` and `:facility_ids`.
pub trait EntitySyncContract: Send + Sync {
    /// Table name, also used as the record type
    fn record_type(&self) -> &'static str;

    fn direction(&self) -> SyncDirection;

    /// Synced columns, excluding `id` and sync bookkeeping
    fn columns(&self) -> &'static [&'static str];

    /// The filter builder this contract supplies, if any
    fn filter_shape(&self) -> Option<FilterShape> {
        None
    }

    /// `None` means visible to every facility
    fn build_sync_filter(&self) -> Option<String> {
        None
    }

    /// `None` means nothing matches
    fn build_patient_sync_filter(
        &self,
        _patient_count: u64,
        _marked_for_sync_patients_table: &str,
        _session_config: &SessionConfig,
    ) -> Option<String> {
        None
    }

    /// `None` materializes with the default select and no scoping columns
    fn build_sync_lookup_query_details(&self) -> Option<LookupQueryDetails> {
        None
    }
}

/// Resolved visibility of a record type for one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Every row inside the tick bounds
    Unconditional,
    /// No rows at all
    Nothing,
    /// Rows selected by the fragment
    Where(String),
}

/// Resolve a contract's builders into a single visibility.
///
/// A global `None` and a patient `None` mean opposite things, so this is the
/// only place either is interpreted.
pub fn resolve_visibility(
    contract: &dyn EntitySyncContract,
    patient_count: u64,
    marked_for_sync_patients_table: &str,
    session_config: &SessionConfig,
) -> Visibility {
    if !contract.direction().is_pulled() {
        return Visibility::Nothing;
    }
    match contract.filter_shape() {
        Some(FilterShape::Global) => contract
            .build_sync_filter()
            .map_or(Visibility::Unconditional, Visibility::Where),
        Some(FilterShape::Patient) => contract
            .build_patient_sync_filter(
                patient_count,
                marked_for_sync_patients_table,
                session_config,
            )
            .map_or(Visibility::Nothing, Visibility::Where),
        None => Visibility::Nothing,
    }
}

/// Registry construction failures; the process must not start
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Record type '{record_type}' syncs {direction} but supplies no filter builder")]
    MissingFilter {
        record_type: String,
        direction: SyncDirection,
    },
    #[error("Record type '{0}' is registered twice")]
    Duplicate(String),
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("Record type '{0}' has a global filter other than the facility filter")]
    UnsupportedGlobalFilter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Everywhere;

    impl EntitySyncContract for Everywhere {
        fn record_type(&self) -> &'static str {
            "everywhere"
        }
        fn direction(&self) -> SyncDirection {
            SyncDirection::PullFromCentral
        }
        fn columns(&self) -> &'static [&'static str] {
            &[]
        }
        fn filter_shape(&self) -> Option<FilterShape> {
            Some(FilterShape::Global)
        }
    }

    struct PatientScoped;

    impl EntitySyncContract for PatientScoped {
        fn record_type(&self) -> &'static str {
            "scoped"
        }
        fn direction(&self) -> SyncDirection {
            SyncDirection::Bidirectional
        }
        fn columns(&self) -> &'static [&'static str] {
            &["patient_id"]
        }
        fn filter_shape(&self) -> Option<FilterShape> {
            Some(FilterShape::Patient)
        }
        fn build_patient_sync_filter(
            &self,
            patient_count: u64,
            marked: &str,
            _session_config: &SessionConfig,
        ) -> Option<String> {
            if patient_count == 0 {
                return None;
            }
            Some(build_patient_linked_sync_filter("scoped", marked))
        }
    }

    struct PushOnly;

    impl EntitySyncContract for PushOnly {
        fn record_type(&self) -> &'static str {
            "push_only"
        }
        fn direction(&self) -> SyncDirection {
            SyncDirection::PushToCentral
        }
        fn columns(&self) -> &'static [&'static str] {
            &[]
        }
    }

    #[test]
    fn test_global_none_is_unconditional() {
        let visibility = resolve_visibility(&Everywhere, 0, "marked", &SessionConfig::default());
        assert_eq!(visibility, Visibility::Unconditional);
    }

    #[test]
    fn test_empty_patient_set_matches_nothing() {
        let visibility =
            resolve_visibility(&PatientScoped, 0, "marked", &SessionConfig::default());
        assert_eq!(visibility, Visibility::Nothing);
    }

    #[test]
    fn test_patient_filter_with_patients() {
        let visibility =
            resolve_visibility(&PatientScoped, 3, "marked", &SessionConfig::default());
        match visibility {
            Visibility::Where(fragment) => {
                assert!(fragment.contains("SELECT patient_id FROM marked"));
                assert!(fragment.contains("scoped.updated_at_sync_tick > :since"));
            }
            other => panic!("expected a fragment, got {other:?}"),
        }
    }

    #[test]
    fn test_push_only_is_never_pulled() {
        let visibility = resolve_visibility(&PushOnly, 5, "marked", &SessionConfig::default());
        assert_eq!(visibility, Visibility::Nothing);
    }

    #[test]
    fn test_direction_sets() {
        assert!(SyncDirection::Bidirectional.is_pulled());
        assert!(SyncDirection::Bidirectional.is_pushed());
        assert!(!SyncDirection::PushToCentral.is_pulled());
        assert!(!SyncDirection::PullFromCentral.is_pushed());
        assert!(!SyncDirection::DoNotSync.is_pulled());
        assert!(!SyncDirection::DoNotSync.is_pushed());
    }
}
