use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::session_keys;
use crate::error::ServiceError;
use crate::llm::{ChatTurn, CompletionRequest, LanguageModel, extract_json};
use crate::models::{DoctorQuery, TranslatedQuery};
use crate::prompts::{TRANSLATOR_PREAMBLE, translator_prompt, translator_repair_prompt};

/// The first answer plus one repair attempt.
pub const MAX_ATTEMPTS: usize = 2;

/// Turn a clinician's question into a structured FHIR query descriptor.
///
/// The model's answer is checked against [`TranslatedQuery::schema`] semantics; an
/// unusable answer is sent back once with the validation error before giving up.
pub async fn translate(
    model: &dyn LanguageModel,
    patient_id: &str,
    query: &DoctorQuery,
) -> Result<TranslatedQuery, ServiceError> {
    if patient_id.trim().is_empty() {
        return Err(ServiceError::BadRequest("patient id must not be empty".to_string()));
    }
    if query.content.trim().is_empty() {
        return Err(ServiceError::BadRequest("query content must not be empty".to_string()));
    }

    info!(
        patient_id = %patient_id,
        query_id = %query.id,
        question = %query.content,
        "Translating question to FHIR query"
    );

    let mut history = Vec::new();
    let mut prompt = translator_prompt(patient_id, query);

    for attempt in 1..=MAX_ATTEMPTS {
        let raw = model
            .complete(CompletionRequest::new(TRANSLATOR_PREAMBLE, prompt.clone()).with_history(history.clone()))
            .await?;

        match parse_translation(&raw) {
            Ok(translated) => {
                info!(
                    attempt = attempt,
                    structured_output = %serde_json::to_string(&translated).unwrap_or_default(),
                    "Structured translation"
                );
                return Ok(translated);
            }
            Err(reason) => {
                warn!(attempt = attempt, reason = %reason, "Translator output rejected");
                if attempt == MAX_ATTEMPTS {
                    return Err(ServiceError::Translation(reason));
                }
                history.push(ChatTurn::user(prompt));
                history.push(ChatTurn::assistant(raw));
                prompt = translator_repair_prompt(&reason);
            }
        }
    }

    Err(ServiceError::Translation("no translation attempts were made".to_string()))
}

fn parse_translation(raw: &str) -> Result<TranslatedQuery, String> {
    let parsed: TranslatedQuery = serde_json::from_str(extract_json(raw))
        .map_err(|e| format!("output does not match the schema: {}", e))?;
    parsed.validate().map_err(|e| e.to_string())
}

/// Pipeline stage wrapping [`translate`].
pub struct TranslateTask {
    model: Arc<dyn LanguageModel>,
}

impl TranslateTask {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Task for TranslateTask {
    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let patient_id: String = context.require(session_keys::PATIENT_ID).await?;
        let query: DoctorQuery = context.require(session_keys::DOCTOR_QUERY).await?;

        let translated = translate(self.model.as_ref(), &patient_id, &query)
            .await
            .map_err(|e| GraphError::TaskExecutionFailed(format!("Translator failed: {}", e)))?;

        context.set(session_keys::TRANSLATED_QUERY, &translated).await?;

        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some(format!("Translated to '{}'", translated.fhir_query)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    const GOOD: &str = r#"```json
{"intent": "retrieve encounters", "entities": {"resource_type": "Encounter"}, "ambiguities": ["Unclear date range."], "fhir_query": "?patient=abc-123&_sort=-_lastUpdated"}
```"#;

    #[tokio::test]
    async fn test_translate_parses_fenced_output() {
        let model = ScriptedModel::new([GOOD]);
        let query = DoctorQuery::new("Any recent hospital visits?");

        let translated = translate(&model, "abc-123", &query).await.unwrap();

        assert_eq!(translated.intent, "retrieve encounters");
        assert_eq!(translated.fhir_query, "patient=abc-123&_sort=-_lastUpdated");
        assert_eq!(translated.ambiguities(), ["Unclear date range."]);

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].preamble, TRANSLATOR_PREAMBLE);
        assert!(requests[0].prompt.contains("Patient ID: abc-123"));
    }

    #[tokio::test]
    async fn test_translate_repairs_once() {
        let model = ScriptedModel::new([
            r#"{"intent": "retrieve encounters", "entities": {}, "fhir_query": "patient abc-123"}"#,
            GOOD,
        ]);
        let query = DoctorQuery::new("Any recent hospital visits?");

        let translated = translate(&model, "abc-123", &query).await.unwrap();
        assert_eq!(translated.fhir_query, "patient=abc-123&_sort=-_lastUpdated");

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].history.len(), 2);
        assert!(requests[1].prompt.contains("could not be used"));
    }

    #[tokio::test]
    async fn test_translate_gives_up_after_second_failure() {
        let model = ScriptedModel::new(["not json", "still not json"]);
        let query = DoctorQuery::new("Any recent hospital visits?");

        let err = translate(&model, "abc-123", &query).await.unwrap_err();
        assert!(matches!(err, ServiceError::Translation(_)));
        assert_eq!(model.requests().len(), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_translate_is_structurally_stable() {
        let model = ScriptedModel::new([GOOD, GOOD]);
        let query = DoctorQuery::new("Any recent hospital visits?");

        let first = translate(&model, "abc-123", &query).await.unwrap();
        let second = translate(&model, "abc-123", &query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(model.requests()[0], model.requests()[1]);
    }

    #[tokio::test]
    async fn test_translate_rejects_empty_input_without_model_call() {
        let model = ScriptedModel::default();

        let err = translate(&model, " ", &DoctorQuery::new("question")).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));

        let err = translate(&model, "abc", &DoctorQuery::new("")).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn test_task_stores_translation_in_context() {
        let task = TranslateTask::new(Arc::new(ScriptedModel::new([GOOD])));
        let context = Context::new();
        context.set(session_keys::PATIENT_ID, "abc-123").await.unwrap();
        context
            .set(session_keys::DOCTOR_QUERY, DoctorQuery::new("Any recent hospital visits?"))
            .await
            .unwrap();

        let result = task.run(context.clone()).await.unwrap();

        assert_eq!(result.next_action, NextAction::Continue);
        let stored: TranslatedQuery = context.require(session_keys::TRANSLATED_QUERY).await.unwrap();
        assert_eq!(stored.intent, "retrieve encounters");
    }

    #[tokio::test]
    async fn test_task_requires_inputs() {
        let task = TranslateTask::new(Arc::new(ScriptedModel::default()));
        let err = task.run(Context::new()).await.unwrap_err();
        assert!(matches!(err, GraphError::ContextError(_)));
    }
}
