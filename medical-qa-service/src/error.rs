use agent_flow::GraphError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::config::ConfigError;
use crate::evidence::EvidenceError;
use crate::fhir::FhirError;
use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Language model error: {0}")]
    Llm(#[from] LlmError),

    #[error("Record server error: {0}")]
    Fhir(#[from] FhirError),

    #[error("Evidence retrieval error: {0}")]
    Evidence(#[from] EvidenceError),

    #[error("Query translation failed: {0}")]
    Translation(String),

    #[error("Pipeline failed: {0}")]
    Pipeline(#[from] GraphError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Fhir(FhirError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Fhir(FhirError::InvalidQuery(_)) | ServiceError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "Service is misconfigured",
            ServiceError::Llm(_) => "Failed to generate a response",
            ServiceError::Fhir(FhirError::NotFound(_)) => "Resource not found",
            ServiceError::Fhir(FhirError::MultipleResourcesFound(_)) => "Multiple resources found",
            ServiceError::Fhir(_) => "Failed to query the record server",
            ServiceError::Evidence(_) => "Failed to retrieve literature evidence",
            ServiceError::Translation(_) => "Failed to translate the query",
            ServiceError::Pipeline(_) => "Failed to answer the query",
            ServiceError::BadRequest(_) => "Invalid request",
            ServiceError::Serialization(_) => "Failed to encode the response",
        }
    }

    /// JSON error frame sent over a WebSocket in place of an answer.
    pub fn error_frame(&self) -> String {
        json!({ "error": self.to_string() }).to_string()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.summary(),
            "details": self.to_string()
        }));
        (self.status_code(), body).into_response()
    }
}
