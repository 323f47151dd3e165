pub mod config;
pub mod error;
pub mod evidence;
pub mod fhir;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod records;
pub mod service;
pub mod tasks;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use error::ServiceError;
pub use evidence::{EvidenceError, EvidenceRetriever, PubMedRetriever};
pub use fhir::{FhirClient, FhirError, RecordServer};
pub use llm::{CompletionRequest, LanguageModel, LlmError, OpenRouterModel, TextStream};
pub use models::*;
pub use orchestrator::{FrameStream, Orchestrator};
pub use service::{AppState, build_router, create_app};
