use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::session_keys;
use crate::error::ServiceError;
use crate::llm::{CompletionRequest, LanguageModel, LlmError};
use crate::models::{FormattedSummary, RawRecordBundle, TranslatedQuery};
use crate::prompts::{FORMATTER_PREAMBLE, empty_bundle_summary, formatter_prompt};

/// Summarize retrieved records for the answering model.
///
/// An empty bundle is reported as such without calling the model.
pub async fn format(
    model: &dyn LanguageModel,
    translated: &TranslatedQuery,
    bundle: &RawRecordBundle,
) -> Result<FormattedSummary, ServiceError> {
    if bundle.is_empty() {
        info!(fhir_query = %translated.fhir_query, "No records to format");
        return Ok(FormattedSummary(empty_bundle_summary(translated)));
    }

    let summary = model
        .complete(CompletionRequest::new(FORMATTER_PREAMBLE, formatter_prompt(translated, bundle)))
        .await?;
    let summary = summary.trim();
    if summary.is_empty() {
        return Err(LlmError::EmptyResponse.into());
    }

    info!(summary_len = summary.len(), "Formatted FHIR data");
    Ok(FormattedSummary(summary.to_string()))
}

/// Pipeline stage wrapping [`format`].
pub struct FormatTask {
    model: Arc<dyn LanguageModel>,
}

impl FormatTask {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for FormatTask {
    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let translated: TranslatedQuery = context.require(session_keys::TRANSLATED_QUERY).await?;
        let bundle: RawRecordBundle = context.require(session_keys::RAW_BUNDLE).await?;

        let summary = format(self.model.as_ref(), &translated, &bundle)
            .await
            .map_err(|e| GraphError::TaskExecutionFailed(format!("Formatter failed: {}", e)))?;

        context.set(session_keys::FORMATTED_SUMMARY, &summary).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some("Formatted patient data".to_string()),
        ))
    }
}
