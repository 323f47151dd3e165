use agent_flow::{ExecutionStatus, Graph, GraphBuilder, GraphError, Session, Task};
use futures::{StreamExt, stream::BoxStream};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::evidence::EvidenceRetriever;
use crate::fhir::{FetchRecordsTool, RecordServer};
use crate::llm::{CompletionRequest, LanguageModel, LlmError};
use crate::models::{AssistantResponse, DoctorQuery, EvidenceDocument, PipelineStage};
use crate::prompts::{ASSISTANT_PREAMBLE, NO_EVIDENCE_PLACEHOLDER, general_qa_prompt};
use crate::tasks::{AnswerTask, FormatTask, RetrieveTask, TranslateTask, session_keys};

/// Framed answer fragments of a streamed general answer.
pub type FrameStream = BoxStream<'static, Result<String, ServiceError>>;

/// Top-level coordinator for both conversation modes.
///
/// The patient pipeline graph is built once; each request runs in its own
/// [`Session`], so concurrent requests never share working data.
#[derive(Clone)]
pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    evidence: Arc<dyn EvidenceRetriever>,
    graph: Arc<Graph>,
    stages: Arc<HashMap<String, PipelineStage>>,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        evidence: Arc<dyn EvidenceRetriever>,
        records: Arc<dyn RecordServer>,
    ) -> Self {
        let translate = Arc::new(TranslateTask::new(model.clone()));
        let retrieve = Arc::new(RetrieveTask::new(model.clone(), FetchRecordsTool::new(records)));
        let format = Arc::new(FormatTask::new(model.clone()));
        let answer = Arc::new(AnswerTask::new(model.clone()));

        let translate_id = translate.id().to_string();
        let retrieve_id = retrieve.id().to_string();
        let format_id = format.id().to_string();
        let answer_id = answer.id().to_string();

        let stages = HashMap::from([
            (translate_id.clone(), PipelineStage::Translating),
            (retrieve_id.clone(), PipelineStage::Retrieving),
            (format_id.clone(), PipelineStage::Formatting),
            (answer_id.clone(), PipelineStage::Generating),
        ]);

        let graph = GraphBuilder::new("patient_medical_qa")
            .add_task(translate)
            .add_task(retrieve)
            .add_task(format)
            .add_task(answer)
            .add_edge(&translate_id, &retrieve_id)
            .add_edge(&retrieve_id, &format_id)
            .add_edge(&format_id, &answer_id)
            .set_start_task(&translate_id)
            .build();

        Self {
            model,
            evidence,
            graph: Arc::new(graph),
            stages: Arc::new(stages),
        }
    }

    /// Answer a general question grounded in literature evidence.
    pub async fn general_medical_qa_chat(&self, query: &DoctorQuery) -> Result<AssistantResponse, ServiceError> {
        let request_id = Uuid::new_v4().to_string();
        let request = self.general_request(&request_id, query).await?;

        log_stage(&request_id, PipelineStage::Generating);
        let answer = self.model.complete(request).await.inspect_err(|e| {
            error!(request_id = %request_id, stage = %PipelineStage::Failed, error = %e, "General answer failed");
        })?;

        log_stage(&request_id, PipelineStage::Complete);
        Ok(AssistantResponse::now(answer))
    }

    /// Like [`Orchestrator::general_medical_qa_chat`], but the answer arrives as
    /// `data: ...` frames in generation order.
    ///
    /// Failures before generation starts are returned as an error; a failure
    /// mid-generation ends the stream with that error.
    pub async fn general_medical_qa_chat_stream(&self, query: &DoctorQuery) -> Result<FrameStream, ServiceError> {
        let request_id = Uuid::new_v4().to_string();
        let request = self.general_request(&request_id, query).await?;

        log_stage(&request_id, PipelineStage::Generating);
        let fragments = self.model.stream(request).await.inspect_err(|e| {
            error!(request_id = %request_id, stage = %PipelineStage::Failed, error = %e, "General answer stream failed");
        })?;

        let frames = fragments.map(|fragment: Result<String, LlmError>| {
            fragment.map(|f| frame_fragment(&f)).map_err(ServiceError::from)
        });
        Ok(frames.boxed())
    }

    /// Answer a question about one patient through translate, retrieve, format and answer.
    ///
    /// Stages run strictly in order; the first failing stage fails the request.
    pub async fn patient_medical_qa_chat(
        &self,
        patient_id: &str,
        query: &DoctorQuery,
    ) -> Result<AssistantResponse, ServiceError> {
        let start_task = self.graph.require_start_task()?;
        let mut session =
            Session::new_from_task(Uuid::new_v4().to_string(), start_task).with_graph_id(self.graph.id.clone());

        info!(
            session_id = %session.id,
            patient_id = %patient_id,
            query_id = %query.id,
            stage = %PipelineStage::Received,
            "Patient query received"
        );
        session.context.set(session_keys::PATIENT_ID, patient_id).await?;
        session.context.set(session_keys::DOCTOR_QUERY, query).await?;

        loop {
            let current = session.current_task_id.clone();
            let stage = self.stage_of(&current);
            log_stage(&session.id, stage);

            let result = match self.graph.execute_session(&mut session).await {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        session_id = %session.id,
                        stage = %PipelineStage::Failed,
                        failed_stage = %stage,
                        error = %e,
                        "Patient pipeline failed"
                    );
                    return Err(e.into());
                }
            };

            match result.status {
                ExecutionStatus::Completed => {
                    let answer = result.response.ok_or(LlmError::EmptyResponse)?;
                    info!(
                        session_id = %session.id,
                        stage = %PipelineStage::Complete,
                        trail = ?session.trail,
                        "Patient query answered"
                    );
                    return Ok(AssistantResponse::now(answer));
                }
                ExecutionStatus::WaitingForInput if session.current_task_id == current => {
                    return Err(GraphError::TaskExecutionFailed(format!(
                        "pipeline did not advance past {}",
                        current
                    ))
                    .into());
                }
                ExecutionStatus::WaitingForInput => {}
            }
        }
    }

    async fn general_request(&self, request_id: &str, query: &DoctorQuery) -> Result<CompletionRequest, ServiceError> {
        if query.content.trim().is_empty() {
            return Err(ServiceError::BadRequest("query content must not be empty".to_string()));
        }

        info!(
            request_id = %request_id,
            query_id = %query.id,
            stage = %PipelineStage::Received,
            "General query received"
        );
        log_stage(request_id, PipelineStage::EvidenceLookup);

        let documents = self.evidence.relevant_documents(&query.content).await.inspect_err(|e| {
            error!(request_id = %request_id, stage = %PipelineStage::Failed, error = %e, "Evidence lookup failed");
        })?;
        info!(request_id = %request_id, documents = documents.len(), "Evidence retrieved");

        let prompt = general_qa_prompt(&query.content, &evidence_context(&documents));
        Ok(CompletionRequest::new(ASSISTANT_PREAMBLE, prompt))
    }

    fn stage_of(&self, task_id: &str) -> PipelineStage {
        self.stages.get(task_id).copied().unwrap_or(PipelineStage::Generating)
    }
}

fn log_stage(id: &str, stage: PipelineStage) {
    info!(request_id = %id, stage = %stage, "Pipeline stage");
}

/// Evidence block for the general prompt; never empty.
pub fn evidence_context(documents: &[EvidenceDocument]) -> String {
    if documents.is_empty() {
        return NO_EVIDENCE_PLACEHOLDER.to_string();
    }
    documents
        .iter()
        .map(EvidenceDocument::context_line)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Wrap one fragment as a transport event; newlines become `<br>`.
pub fn frame_fragment(fragment: &str) -> String {
    format!("data: {}\n\n", fragment.replace('\n', "<br>"))
}
