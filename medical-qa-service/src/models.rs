use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

use crate::fhir::query::{FhirQuery, QuerySyntaxError};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user", alias = "doctor", alias = "USER", alias = "DOCTOR")]
    Doctor,
    #[serde(rename = "assistant", alias = "ASSISTANT")]
    Assistant,
}

/// A clinician's question as received from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorQuery {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl DoctorQuery {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Doctor,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// The answer sent back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub id: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl AssistantResponse {
    /// Stamp `content` with the current time, used as both `id` and `created_at`.
    pub fn now(content: impl Into<String>) -> Self {
        let created_at = Utc::now();
        Self {
            id: created_at,
            role: Role::Assistant,
            content: content.into(),
            created_at,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("intent must not be empty")]
    EmptyIntent,

    #[error("fhir_query must not be empty")]
    EmptyQuery,

    #[error("fhir_query is not valid search syntax: {0}")]
    InvalidQuery(#[from] QuerySyntaxError),
}

/// Structured form of a clinician's question, produced by the query translator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedQuery {
    pub intent: String,
    #[serde(default)]
    pub entities: Map<String, Value>,
    #[serde(default)]
    pub ambiguities: Option<Vec<String>>,
    pub fhir_query: String,
}

impl TranslatedQuery {
    /// JSON schema the translator output must satisfy.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["intent", "entities", "fhir_query"],
            "additionalProperties": false,
            "properties": {
                "intent": {
                    "type": "string",
                    "description": "The primary goal of the query."
                },
                "entities": {
                    "type": "object",
                    "description": "Key entities extracted from the query, keyed by concept name."
                },
                "ambiguities": {
                    "type": ["array", "null"],
                    "items": { "type": "string" },
                    "description": "Any ambiguities or missing details."
                },
                "fhir_query": {
                    "type": "string",
                    "description": "FHIR search parameters, e.g. patient=123&date=ge2024-01-01. No server URL."
                }
            }
        })
    }

    /// Check the semantic constraints serde cannot express and normalize the query string.
    pub fn validate(mut self) -> Result<Self, SchemaError> {
        self.intent = self.intent.trim().to_string();
        if self.intent.is_empty() {
            return Err(SchemaError::EmptyIntent);
        }

        let query = self.fhir_query.trim().trim_start_matches('?').trim();
        if query.is_empty() {
            return Err(SchemaError::EmptyQuery);
        }
        FhirQuery::parse(query)?;
        self.fhir_query = query.to_string();

        Ok(self)
    }

    pub fn ambiguities(&self) -> &[String] {
        self.ambiguities.as_deref().unwrap_or_default()
    }

    pub fn entities_json(&self) -> String {
        Value::Object(self.entities.clone()).to_string()
    }

    pub fn ambiguities_json(&self) -> String {
        match &self.ambiguities {
            Some(items) => json!(items).to_string(),
            None => "None".to_string(),
        }
    }
}

/// Whatever the record retriever ended its session with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecordBundle(pub Value);

impl RawRecordBundle {
    pub fn empty() -> Self {
        Self(Value::Array(Vec::new()))
    }

    pub fn from_records(records: Vec<Value>) -> Self {
        Self(Value::Array(records))
    }

    /// True when the bundle carries no records at all.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) if map.get("resourceType").and_then(Value::as_str) == Some("Bundle") => {
                map.get("entry")
                    .and_then(Value::as_array)
                    .is_none_or(|entries| entries.is_empty())
                    && map.get("total").and_then(Value::as_u64).unwrap_or(0) == 0
            }
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Number of top-level records, when the bundle is a list or a Bundle resource.
    pub fn record_count(&self) -> Option<usize> {
        match &self.0 {
            Value::Array(items) => Some(items.len()),
            Value::Object(map) => map.get("entry").and_then(Value::as_array).map(Vec::len),
            _ => None,
        }
    }

    /// Text rendering for prompts.
    pub fn render(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Natural-language summary of the retrieved records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormattedSummary(pub String);

impl FormattedSummary {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormattedSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One literature search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub id: String,
    pub title: String,
    pub published: String,
    pub content: String,
}

impl EvidenceDocument {
    pub fn context_line(&self) -> String {
        format!(
            "PubMed ID: {} | Title: {} | Published: {} | Content: {}",
            or_unknown(&self.id),
            or_unknown(&self.title),
            or_unknown(&self.published),
            self.content
        )
    }
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() { "Unknown" } else { value }
}

/// How answers are delivered on a general QA connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseMode {
    #[default]
    Normal,
    Stream,
}

impl ResponseMode {
    /// Parse a mode flag; unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NORMAL" => Some(Self::Normal),
            "STREAM" => Some(Self::Stream),
            _ => None,
        }
    }
}

/// Per-request pipeline states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Received,
    Translating,
    Retrieving,
    Formatting,
    EvidenceLookup,
    Generating,
    Complete,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Translating => "TRANSLATING",
            Self::Retrieving => "RETRIEVING",
            Self::Formatting => "FORMATTING",
            Self::EvidenceLookup => "EVIDENCE_LOOKUP",
            Self::Generating => "GENERATING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translated(fhir_query: &str) -> TranslatedQuery {
        TranslatedQuery {
            intent: "retrieve encounters".to_string(),
            entities: Map::new(),
            ambiguities: Some(vec!["Unclear date range.".to_string()]),
            fhir_query: fhir_query.to_string(),
        }
    }

    #[test]
    fn test_doctor_query_accepts_frontend_payload() {
        let raw = r#"{
            "id": "q-1",
            "role": "user",
            "content": "Any recent hospital visits?",
            "created_at": "2025-02-07T10:15:00Z"
        }"#;

        let query: DoctorQuery = serde_json::from_str(raw).unwrap();
        assert_eq!(query.role, Role::Doctor);
        assert_eq!(query.content, "Any recent hospital visits?");
    }

    #[test]
    fn test_doctor_query_rejects_missing_fields() {
        let raw = r#"{"id": "q-1", "role": "user"}"#;
        assert!(serde_json::from_str::<DoctorQuery>(raw).is_err());
    }

    #[test]
    fn test_assistant_response_uses_time_as_id() {
        let response = AssistantResponse::now("answer");
        assert_eq!(response.role, Role::Assistant);
        assert_eq!(response.id, response.created_at);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json["id"].is_string());
        assert_eq!(json["id"], json["created_at"]);
    }

    #[test]
    fn test_validate_strips_leading_question_mark() {
        let query = translated("?patient=abc-123&_sort=-_lastUpdated").validate().unwrap();
        assert_eq!(query.fhir_query, "patient=abc-123&_sort=-_lastUpdated");
    }

    #[test]
    fn test_validate_keeps_ambiguous_but_valid_query() {
        let query = translated("patient=abc-123").validate().unwrap();
        assert_eq!(query.ambiguities().len(), 1);
    }

    #[test]
    fn test_validate_rejects_broken_query() {
        assert_eq!(translated("  ").validate().unwrap_err(), SchemaError::EmptyQuery);
        assert!(matches!(
            translated("patient abc").validate().unwrap_err(),
            SchemaError::InvalidQuery(_)
        ));

        let mut no_intent = translated("patient=abc");
        no_intent.intent = " ".to_string();
        assert_eq!(no_intent.validate().unwrap_err(), SchemaError::EmptyIntent);
    }

    #[test]
    fn test_missing_ambiguities_deserialize_as_none() {
        let raw = r#"{"intent": "x", "entities": {"resource": "Encounter"}, "fhir_query": "patient=1"}"#;
        let query: TranslatedQuery = serde_json::from_str(raw).unwrap();
        assert!(query.ambiguities.is_none());
        assert!(query.ambiguities().is_empty());
        assert_eq!(query.ambiguities_json(), "None");
    }

    #[test]
    fn test_bundle_emptiness() {
        assert!(RawRecordBundle::empty().is_empty());
        assert!(RawRecordBundle(Value::Null).is_empty());
        assert!(RawRecordBundle(json!({"resourceType": "Bundle", "total": 0})).is_empty());
        assert!(!RawRecordBundle(json!({"resourceType": "Bundle", "total": 4})).is_empty());
        assert!(!RawRecordBundle(json!([{"resourceType": "Encounter"}])).is_empty());
        assert!(!RawRecordBundle(json!(3)).is_empty());
    }

    #[test]
    fn test_evidence_context_line_marks_unknown_metadata() {
        let doc = EvidenceDocument {
            id: "123".to_string(),
            title: String::new(),
            published: "2024-05-01".to_string(),
            content: "Abstract".to_string(),
        };
        assert_eq!(
            doc.context_line(),
            "PubMed ID: 123 | Title: Unknown | Published: 2024-05-01 | Content: Abstract"
        );
    }

    #[test]
    fn test_response_mode_parse() {
        assert_eq!(ResponseMode::parse("STREAM"), Some(ResponseMode::Stream));
        assert_eq!(ResponseMode::parse("NORMAL"), Some(ResponseMode::Normal));
        assert_eq!(ResponseMode::parse("stream"), None);
        assert_eq!(ResponseMode::default(), ResponseMode::Normal);
    }
}
