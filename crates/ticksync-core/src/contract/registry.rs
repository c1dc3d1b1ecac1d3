//! Typed registry of sync contracts, validated once at startup

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use super::{
    build_facility_sync_filter, ContractError, EntitySyncContract, FilterShape, SessionConfig,
};
use crate::error::{Error, Result};

const IDENTIFIER_PATTERN: &str = r"^[a-z][a-z0-9_]*$";
const PROBE_TABLE: &str = "marked_for_sync_patients_probe";

/// All record types known to the sync engine, keyed by record type
#[derive(Clone)]
pub struct SyncRegistry {
    contracts: BTreeMap<&'static str, Arc<dyn EntitySyncContract>>,
}

impl std::fmt::Debug for SyncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegistry")
            .field("record_types", &self.contracts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SyncRegistry {
    /// Build the registry, refusing contracts that could not be served.
    ///
    /// Pulled types must supply a filter builder; a patient builder must
    /// produce a fragment once patients are marked.
    pub fn new(
        contracts: impl IntoIterator<Item = Arc<dyn EntitySyncContract>>,
    ) -> std::result::Result<Self, ContractError> {
        let identifier = Regex::new(IDENTIFIER_PATTERN)
            .map_err(|_| ContractError::InvalidIdentifier(IDENTIFIER_PATTERN.to_string()))?;

        let mut registry = BTreeMap::new();
        for contract in contracts {
            let record_type = contract.record_type();
            for name in std::iter::once(&record_type).chain(contract.columns()) {
                if !identifier.is_match(name) {
                    return Err(ContractError::InvalidIdentifier((*name).to_string()));
                }
            }

            if contract.filter_shape() == Some(FilterShape::Global)
                && contract
                    .build_sync_filter()
                    .is_some_and(|fragment| fragment != build_facility_sync_filter(record_type))
            {
                return Err(ContractError::UnsupportedGlobalFilter(record_type.to_string()));
            }

            let direction = contract.direction();
            if direction.is_pulled() {
                let serviceable = match contract.filter_shape() {
                    Some(FilterShape::Global) => true,
                    Some(FilterShape::Patient) => contract
                        .build_patient_sync_filter(1, PROBE_TABLE, &SessionConfig::default())
                        .is_some(),
                    None => false,
                };
                if !serviceable {
                    return Err(ContractError::MissingFilter {
                        record_type: record_type.to_string(),
                        direction,
                    });
                }
            }

            if registry.insert(record_type, contract).is_some() {
                return Err(ContractError::Duplicate(record_type.to_string()));
            }
        }

        tracing::debug!(record_types = registry.len(), "Sync registry built");
        Ok(Self {
            contracts: registry,
        })
    }

    pub fn get(&self, record_type: &str) -> Option<&Arc<dyn EntitySyncContract>> {
        self.contracts.get(record_type)
    }

    /// Look up a record type, rejecting unknown names
    pub fn resolve(&self, record_type: &str) -> Result<&Arc<dyn EntitySyncContract>> {
        self.get(record_type)
            .ok_or_else(|| Error::UnknownRecordType(record_type.to_string()))
    }

    /// Resolve every name or fail on the first unknown one
    pub fn resolve_many<S: AsRef<str>>(
        &self,
        record_types: &[S],
    ) -> Result<Vec<&Arc<dyn EntitySyncContract>>> {
        record_types
            .iter()
            .map(|record_type| self.resolve(record_type.as_ref()))
            .collect()
    }

    /// Types sent from central to devices
    pub fn for_pull(&self) -> Vec<&Arc<dyn EntitySyncContract>> {
        self.contracts
            .values()
            .filter(|contract| contract.direction().is_pulled())
            .collect()
    }

    /// Types accepted from devices
    pub fn for_push(&self) -> Vec<&Arc<dyn EntitySyncContract>> {
        self.contracts
            .values()
            .filter(|contract| contract.direction().is_pushed())
            .collect()
    }

    /// Pulled types whose visibility follows the marked patient set
    pub fn patient_linked(&self) -> Vec<&Arc<dyn EntitySyncContract>> {
        self.for_pull()
            .into_iter()
            .filter(|contract| contract.filter_shape() == Some(FilterShape::Patient))
            .collect()
    }

    pub fn record_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.contracts.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}
