//! Direct record-server lookups behind the auxiliary REST endpoints.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::fhir::{FhirError, RecordServer, SearchRequest};

pub const PATIENT_PAGE_LIMIT: usize = 100;
pub const DEFAULT_ENCOUNTER_COUNT: usize = 3;
pub const DEFAULT_CONDITION_COUNT: usize = 1;

const ENCOUNTER_SORT: &str = "-_lastUpdated";
const CONDITION_SORT: &str = "-onset-date,-abatement-date,-recorded-date";

fn require_count(count: usize) -> Result<usize, FhirError> {
    if count == 0 {
        return Err(FhirError::InvalidQuery("count must be at least 1".to_string()));
    }
    Ok(count)
}

#[derive(Clone)]
pub struct PatientsService {
    server: Arc<dyn RecordServer>,
}

impl PatientsService {
    pub fn new(server: Arc<dyn RecordServer>) -> Self {
        Self { server }
    }

    pub async fn get_one(&self, patient_id: &str) -> Result<Value, FhirError> {
        let request = SearchRequest::new("Patient").param("_id", patient_id);
        self.server.search_one(&request).await
    }

    pub async fn get_many(&self) -> Result<Vec<Value>, FhirError> {
        let request = SearchRequest::new("Patient").limit(PATIENT_PAGE_LIMIT);
        let patients = self.server.search(&request).await?;
        debug!(patients = patients.len(), "Fetched patients");
        Ok(patients)
    }
}

#[derive(Clone)]
pub struct EncountersService {
    server: Arc<dyn RecordServer>,
}

impl EncountersService {
    pub fn new(server: Arc<dyn RecordServer>) -> Self {
        Self { server }
    }

    /// The `count` most recently updated encounters of a patient.
    pub async fn recent(&self, patient_id: &str, count: usize) -> Result<Vec<Value>, FhirError> {
        let request = SearchRequest::new("Encounter")
            .param("patient", patient_id)
            .limit(require_count(count)?)
            .sort(ENCOUNTER_SORT);
        let encounters = self.server.search(&request).await?;
        debug!(patient_id = %patient_id, encounters = encounters.len(), "Fetched recent encounters");
        Ok(encounters)
    }
}

#[derive(Clone)]
pub struct ConditionsService {
    server: Arc<dyn RecordServer>,
}

impl ConditionsService {
    pub fn new(server: Arc<dyn RecordServer>) -> Self {
        Self { server }
    }

    /// Latest conditions of a patient by onset, abatement, then recorded date.
    pub async fn latest(&self, patient_id: &str, count: usize) -> Result<Vec<Value>, FhirError> {
        let request = SearchRequest::new("Condition")
            .param("patient", patient_id)
            .limit(require_count(count)?)
            .sort(CONDITION_SORT);
        let conditions = self.server.search(&request).await?;
        debug!(patient_id = %patient_id, conditions = conditions.len(), "Fetched latest conditions");
        Ok(conditions)
    }
}
