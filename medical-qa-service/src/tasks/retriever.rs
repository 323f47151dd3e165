use agent_flow::{Context, GraphError, NextAction, Task, TaskResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session_keys;
use crate::error::ServiceError;
use crate::fhir::{FetchRecordsArgs, FetchRecordsTool, FhirError, TOOL_NAME, ToolOutput};
use crate::llm::{ChatTurn, CompletionRequest, LanguageModel, extract_json};
use crate::models::{RawRecordBundle, TranslatedQuery};
use crate::prompts::{RETRIEVER_PREAMBLE, retriever_prompt, tool_error_message, tool_result_message};

/// Upper bound on model turns in one retrieval session.
pub const MAX_TURNS: usize = 8;

const CONTINUE_PROMPT: &str = "Continue with your next action.";

/// One reply of the retriever model.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrieverAction {
    FetchRecords(FetchRecordsArgs),
    Noop,
    Finish { result: Value },
}

impl RetrieverAction {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut value: Value = serde_json::from_str(extract_json(raw))
            .map_err(|e| format!("reply is not valid JSON: {}", e))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| "reply is not a JSON object".to_string())?;
        let action = object
            .remove("action")
            .and_then(|a| a.as_str().map(str::to_string))
            .ok_or_else(|| "reply has no 'action' field".to_string())?;

        match action.as_str() {
            TOOL_NAME | "fetch_records" => {
                let args = match object.remove("arguments") {
                    Some(arguments @ Value::Object(_)) => arguments,
                    _ => Value::Object(std::mem::take(object)),
                };
                serde_json::from_value(args)
                    .map(RetrieverAction::FetchRecords)
                    .map_err(|e| format!("invalid {} arguments: {}", TOOL_NAME, e))
            }
            "noop" => Ok(RetrieverAction::Noop),
            "finish" => Ok(RetrieverAction::Finish {
                result: object.remove("result").unwrap_or(Value::Null),
            }),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Drive the model through a tool-using session until it finishes.
///
/// Tool failures and unparseable replies are reported back to the model so it can
/// adjust. If the turn budget runs out, whatever records were fetched so far are
/// returned as the bundle.
pub async fn retrieve(
    model: &dyn LanguageModel,
    tool: &FetchRecordsTool,
    translated: &TranslatedQuery,
) -> Result<RawRecordBundle, ServiceError> {
    info!(fhir_query = %translated.fhir_query, "Retrieving FHIR resources");

    let mut history = Vec::new();
    let mut prompt = retriever_prompt(translated);
    let mut collected = Vec::new();

    for turn in 1..=MAX_TURNS {
        let raw = model
            .complete(CompletionRequest::new(RETRIEVER_PREAMBLE, prompt.clone()).with_history(history.clone()))
            .await?;
        debug!(turn = turn, reply = %raw, "Retriever reply");

        let next_prompt = match RetrieverAction::parse(&raw) {
            Ok(RetrieverAction::Finish { result }) => {
                let bundle = RawRecordBundle(result);
                info!(
                    turn = turn,
                    records = ?bundle.record_count(),
                    "Retriever finished"
                );
                return Ok(bundle);
            }
            Ok(RetrieverAction::Noop) => CONTINUE_PROMPT.to_string(),
            Ok(RetrieverAction::FetchRecords(args)) => match tool.call(&args).await {
                Ok(output) => {
                    let message =
                        tool_result_message(&serde_json::to_value(&output).map_err(FhirError::from)?);
                    if let ToolOutput::Records(records) = output {
                        collected.extend(records);
                    }
                    message
                }
                Err(e) => {
                    warn!(turn = turn, error = %e, "Record fetch tool failed");
                    tool_error_message(&e.to_string())
                }
            },
            Err(reason) => {
                warn!(turn = turn, reason = %reason, "Retriever reply rejected");
                tool_error_message(&reason)
            }
        };

        history.push(ChatTurn::user(prompt));
        history.push(ChatTurn::assistant(raw));
        prompt = next_prompt;
    }

    warn!(
        turns = MAX_TURNS,
        collected = collected.len(),
        "Retriever did not finish within its turn budget; using collected records"
    );
    Ok(RawRecordBundle::from_records(collected))
}

/// Pipeline stage wrapping [`retrieve`].
pub struct RetrieveTask {
    model: Arc<dyn LanguageModel>,
    tool: FetchRecordsTool,
}

impl RetrieveTask {
    pub fn new(model: Arc<dyn LanguageModel>, tool: FetchRecordsTool) -> Self {
        Self { model, tool }
    }
}

#[async_trait]
impl Task for RetrieveTask {
    async fn run(&self, context: Context) -> agent_flow::Result<TaskResult> {
        let translated: TranslatedQuery = context.require(session_keys::TRANSLATED_QUERY).await?;

        let bundle = retrieve(self.model.as_ref(), &self.tool, &translated)
            .await
            .map_err(|e| GraphError::TaskExecutionFailed(format!("Retriever failed: {}", e)))?;

        let status = match bundle.record_count() {
            Some(count) => format!("Retrieved {} records", count),
            None => "Retrieved records".to_string(),
        };
        context.set(session_keys::RAW_BUNDLE, &bundle).await?;

        Ok(TaskResult::new_with_status(None, NextAction::Continue, Some(status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::testing::{MemoryRecordServer, ScriptedModel, encounter};
    use serde_json::json;

    fn translated() -> TranslatedQuery {
        serde_json::from_value(json!({
            "intent": "retrieve encounters",
            "entities": {"resource_type": "Encounter"},
            "fhir_query": "patient=abc-123&_sort=-_lastUpdated"
        }))
        .unwrap()
    }

    fn server() -> Arc<MemoryRecordServer> {
        Arc::new(MemoryRecordServer::new(vec![
            encounter("e1", "abc-123", "2024-03-01"),
            encounter("e2", "abc-123", "2024-02-01"),
            encounter("e3", "abc-123", "2024-01-01"),
            encounter("e4", "abc-123", "2023-12-01"),
        ]))
    }

    const FETCH: &str = r#"{"action": "get_fhir_resources", "resource_type": "Encounter", "search_params": {"patient": "abc-123"}, "limit": 3, "sort": "-_lastUpdated"}"#;

    #[test]
    fn test_parse_actions() {
        match RetrieverAction::parse(FETCH).unwrap() {
            RetrieverAction::FetchRecords(args) => {
                assert_eq!(args.resource_type, "Encounter");
                assert_eq!(args.limit, Some(3));
                assert_eq!(args.sort.as_deref(), Some("-_lastUpdated"));
            }
            other => panic!("unexpected action: {:?}", other),
        }

        assert_eq!(RetrieverAction::parse(r#"{"action": "noop"}"#).unwrap(), RetrieverAction::Noop);
        assert_eq!(
            RetrieverAction::parse("```json\n{\"action\": \"finish\", \"result\": [1]}\n```").unwrap(),
            RetrieverAction::Finish { result: json!([1]) }
        );

        let nested = r#"{"action": "get_fhir_resources", "arguments": {"resource_type": "Condition"}}"#;
        assert!(matches!(
            RetrieverAction::parse(nested).unwrap(),
            RetrieverAction::FetchRecords(args) if args.resource_type == "Condition"
        ));
    }

    #[test]
    fn test_parse_rejects_bad_replies() {
        assert!(RetrieverAction::parse("I will fetch the encounters now").is_err());
        assert!(RetrieverAction::parse(r#"{"resource_type": "Encounter"}"#).is_err());
        assert!(RetrieverAction::parse(r#"{"action": "delete_everything"}"#).is_err());
        assert!(RetrieverAction::parse(r#"{"action": "get_fhir_resources", "resource": "x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_retrieve_calls_tool_then_finishes() {
        let server = server();
        let tool = FetchRecordsTool::new(server.clone());
        let model = ScriptedModel::new([
            FETCH.to_string(),
            json!({"action": "finish", "result": [
                encounter("e1", "abc-123", "2024-03-01"),
                encounter("e2", "abc-123", "2024-02-01"),
                encounter("e3", "abc-123", "2024-01-01"),
            ]})
            .to_string(),
        ]);

        let bundle = retrieve(&model, &tool, &translated()).await.unwrap();

        assert_eq!(bundle.record_count(), Some(3));
        let searches = server.searches();
        assert_eq!(searches.len(), 1);
        assert_eq!(searches[0].resource_type, "Encounter");
        assert_eq!(searches[0].limit, Some(3));

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].prompt.starts_with("TOOL_RESULT ["));
        assert!(requests[1].prompt.contains("\"e3\""));
        assert_eq!(requests[1].history.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back_and_session_continues() {
        let server = server();
        server.fail_next(FhirError::NotFound("Encounter".to_string()));
        let tool = FetchRecordsTool::new(server.clone());
        let model = ScriptedModel::new([
            FETCH,
            FETCH,
            r#"{"action": "finish", "result": []}"#,
        ]);

        let bundle = retrieve(&model, &tool, &translated()).await.unwrap();

        assert!(bundle.is_empty());
        let requests = model.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].prompt.starts_with("TOOL_ERROR Resource not found"));
        assert!(requests[2].prompt.starts_with("TOOL_RESULT"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_reported() {
        let tool = FetchRecordsTool::new(server());
        let model = ScriptedModel::new(["Sure, let me look.", r#"{"action": "finish", "result": null}"#]);

        let bundle = retrieve(&model, &tool, &translated()).await.unwrap();

        assert!(bundle.is_empty());
        assert!(model.requests()[1].prompt.starts_with("TOOL_ERROR reply is not valid JSON"));
    }

    #[tokio::test]
    async fn test_turn_budget_returns_collected_records() {
        let tool = FetchRecordsTool::new(server());
        let model = ScriptedModel::default();
        model.push(FETCH);
        for _ in 1..MAX_TURNS {
            model.push(r#"{"action": "noop"}"#);
        }

        let bundle = retrieve(&model, &tool, &translated()).await.unwrap();

        assert_eq!(bundle.record_count(), Some(3));
        assert_eq!(model.requests().len(), MAX_TURNS);
        assert_eq!(model.requests()[2].prompt, CONTINUE_PROMPT);
    }

    #[tokio::test]
    async fn test_model_failure_aborts_retrieval() {
        let tool = FetchRecordsTool::new(server());
        let model = ScriptedModel::default();
        model.push_error(LlmError::Request("connection reset".to_string()));

        let err = retrieve(&model, &tool, &translated()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Llm(_)));
    }

    #[tokio::test]
    async fn test_task_stores_bundle() {
        let model = Arc::new(ScriptedModel::new([r#"{"action": "finish", "result": [{"resourceType": "Encounter", "id": "e1"}]}"#]));
        let task = RetrieveTask::new(model, FetchRecordsTool::new(server()));
        let context = Context::new();
        context.set(session_keys::TRANSLATED_QUERY, translated()).await.unwrap();

        let result = task.run(context.clone()).await.unwrap();

        assert_eq!(result.status_message.as_deref(), Some("Retrieved 1 records"));
        let bundle: RawRecordBundle = context.require(session_keys::RAW_BUNDLE).await.unwrap();
        assert_eq!(bundle.record_count(), Some(1));
    }
}
