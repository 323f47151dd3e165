//! In-crate fakes for the model, record server and literature search.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::evidence::{EvidenceError, EvidenceRetriever};
use crate::fhir::{FhirError, RecordServer, SearchRequest};
use crate::llm::{CompletionRequest, LanguageModel, LlmError, TextStream};
use crate::models::EvidenceDocument;

/// Returns queued replies in order and remembers every request.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    streams: Mutex<VecDeque<Vec<Result<String, LlmError>>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::default();
        for reply in replies {
            model.push(reply);
        }
        model
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn push_stream(&self, fragments: &[&str]) {
        self.streams
            .lock()
            .unwrap()
            .push_back(fragments.iter().map(|f| Ok(f.to_string())).collect());
    }

    /// A stream that yields `fragments` and then fails with `error`.
    pub fn push_broken_stream(&self, fragments: &[&str], error: LlmError) {
        let mut items: Vec<Result<String, LlmError>> = fragments.iter().map(|f| Ok(f.to_string())).collect();
        items.push(Err(error));
        self.streams.lock().unwrap().push_back(items);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Request("script exhausted".to_string())))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        self.requests.lock().unwrap().push(request);
        let fragments = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Request("no stream scripted".to_string()))?;
        Ok(futures::stream::iter(fragments).boxed())
    }
}

/// Record server over a fixed set of resources.
#[derive(Default)]
pub struct MemoryRecordServer {
    resources: Vec<Value>,
    failures: Mutex<VecDeque<FhirError>>,
    searches: Mutex<Vec<SearchRequest>>,
}

impl MemoryRecordServer {
    pub fn new(resources: Vec<Value>) -> Self {
        Self {
            resources,
            ..Default::default()
        }
    }

    /// The next search or count call fails with `error`.
    pub fn fail_next(&self, error: FhirError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().unwrap().clone()
    }

    fn matching(&self, request: &SearchRequest) -> Result<Vec<Value>, FhirError> {
        self.searches.lock().unwrap().push(request.clone());
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let id = request
            .params
            .iter()
            .find(|p| p.key == "_id")
            .map(|p| p.value.clone());

        Ok(self
            .resources
            .iter()
            .filter(|r| r["resourceType"] == request.resource_type.as_str())
            .filter(|r| id.as_deref().is_none_or(|id| r["id"] == id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordServer for MemoryRecordServer {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, FhirError> {
        let mut found = self.matching(request)?;
        if let Some(limit) = request.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn count(&self, request: &SearchRequest) -> Result<u64, FhirError> {
        Ok(self.matching(request)?.len() as u64)
    }

    async fn capability_statement(&self) -> Result<Value, FhirError> {
        Ok(json!({"resourceType": "CapabilityStatement", "fhirVersion": "4.0.1"}))
    }
}

/// Literature search returning a fixed list, or failing.
#[derive(Default)]
pub struct StaticEvidence {
    documents: Vec<EvidenceDocument>,
    unavailable: bool,
}

impl StaticEvidence {
    pub fn new(documents: Vec<EvidenceDocument>) -> Self {
        Self {
            documents,
            unavailable: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            documents: Vec::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl EvidenceRetriever for StaticEvidence {
    async fn relevant_documents(&self, _query: &str) -> Result<Vec<EvidenceDocument>, EvidenceError> {
        if self.unavailable {
            return Err(EvidenceError::Status(503));
        }
        Ok(self.documents.clone())
    }
}

pub fn encounter(id: &str, patient_id: &str, start: &str) -> Value {
    json!({
        "resourceType": "Encounter",
        "id": id,
        "status": "finished",
        "class": {"code": "IMP", "display": "inpatient encounter"},
        "subject": {"reference": format!("Patient/{}", patient_id)},
        "period": {"start": start},
        "serviceProvider": {"display": "General Hospital"}
    })
}

pub fn evidence(id: &str, title: &str) -> EvidenceDocument {
    EvidenceDocument {
        id: id.to_string(),
        title: title.to_string(),
        published: "2024-01-15".to_string(),
        content: format!("Abstract of {}", title),
    }
}
