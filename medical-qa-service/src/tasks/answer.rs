use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::session_keys;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::models::{DoctorQuery, FormattedSummary, TranslatedQuery};
use crate::prompts::{ASSISTANT_PREAMBLE, patient_qa_prompt};

/// Final stage: answer the clinician's question from the formatted patient data.
pub struct AnswerTask {
    model: Arc<dyn LanguageModel>,
}

impl AnswerTask {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for AnswerTask {
    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let query: DoctorQuery = context.require(session_keys::DOCTOR_QUERY).await?;
        let translated: TranslatedQuery = context.require(session_keys::TRANSLATED_QUERY).await?;
        let summary: FormattedSummary = context.require(session_keys::FORMATTED_SUMMARY).await?;

        let prompt = patient_qa_prompt(&query.content, &translated, summary.as_str());
        let answer = self
            .model
            .complete(CompletionRequest::new(ASSISTANT_PREAMBLE, prompt))
            .await
            .map_err(|e| GraphError::TaskExecutionFailed(format!("Answer generation failed: {}", e)))?;

        info!(answer_len = answer.len(), "Generated patient answer");

        Ok(TaskResult::new_with_status(
            Some(answer),
            NextAction::End,
            Some("Answered the query".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use serde_json::json;

    #[tokio::test]
    async fn test_answer_uses_summary_and_ends_pipeline() {
        let model = Arc::new(ScriptedModel::new(["**Query Response**\n- Three recent visits."]));
        let task = AnswerTask::new(model.clone());
        let context = Context::new();
        context
            .set(session_keys::DOCTOR_QUERY, DoctorQuery::new("Any recent hospital visits?"))
            .await
            .unwrap();
        context
            .set(
                session_keys::TRANSLATED_QUERY,
                json!({"intent": "retrieve encounters", "entities": {}, "fhir_query": "patient=abc-123"}),
            )
            .await
            .unwrap();
        context
            .set(session_keys::FORMATTED_SUMMARY, "- Visit on 2024-03-01")
            .await
            .unwrap();

        let result = task.run(context).await.unwrap();

        assert_eq!(result.next_action, NextAction::End);
        assert_eq!(result.response.as_deref(), Some("**Query Response**\n- Three recent visits."));
        let requests = model.requests();
        let prompt = &requests[0].prompt;
        assert!(prompt.contains("- Visit on 2024-03-01"));
        assert!(prompt.contains("Ambiguities: None"));
    }
}
