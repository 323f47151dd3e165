use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

use super::client::{FhirError, RecordServer, SearchRequest};
use super::query::normalize_params;

pub const TOOL_NAME: &str = "get_fhir_resources";

/// Arguments of the record-fetch tool, as requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchRecordsArgs {
    pub resource_type: String,
    #[serde(default)]
    pub search_params: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub require_count: Option<bool>,
}

impl FetchRecordsArgs {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            search_params: Map::new(),
            limit: None,
            sort: None,
            require_count: None,
        }
    }

    pub fn wants_count(&self) -> bool {
        self.require_count.unwrap_or(false)
    }
}

/// What the tool hands back: a count when one was asked for, otherwise the records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Count(u64),
    Records(Vec<Value>),
}

/// Record-fetch tool backed by the record server.
#[derive(Clone)]
pub struct FetchRecordsTool {
    server: Arc<dyn RecordServer>,
}

impl FetchRecordsTool {
    pub fn new(server: Arc<dyn RecordServer>) -> Self {
        Self { server }
    }

    /// Tool description shown to the model.
    pub fn definition() -> Value {
        json!({
            "name": TOOL_NAME,
            "description": "Retrieves resources from the FHIR server based on the specified resource type and search parameters. Returns either the count of matching resources or a list of resources.",
            "parameters": {
                "type": "object",
                "required": ["resource_type"],
                "properties": {
                    "resource_type": {
                        "type": "string",
                        "description": "The type of FHIR resource to retrieve (e.g. 'Patient', 'Observation', 'Encounter')."
                    },
                    "search_params": {
                        "type": "object",
                        "description": "Search parameters to filter the resources. Keys follow FHIR search parameter syntax or the keyword style (e.g. name__contains, birthdate__gt); list values repeat the parameter."
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Maximum number of results to retrieve."
                    },
                    "sort": {
                        "type": "string",
                        "description": "Sort criteria in FHIR syntax, '-' for descending (e.g. '-_lastUpdated' or '-onset-date,-abatement-date,-recorded-date')."
                    },
                    "require_count": {
                        "type": "boolean",
                        "description": "If true, return only the number of matching resources."
                    }
                }
            }
        })
    }

    pub async fn call(&self, args: &FetchRecordsArgs) -> Result<ToolOutput, FhirError> {
        let search_params = serde_json::Value::Object(args.search_params.clone());
        info!(
            tool = TOOL_NAME,
            resource_type = %args.resource_type,
            search_params = %search_params,
            limit = ?args.limit,
            sort = ?args.sort,
            require_count = args.wants_count(),
            "Record fetch tool called"
        );

        if args.limit == Some(0) {
            return Err(FhirError::InvalidQuery("limit must be at least 1".to_string()));
        }

        let mut request = SearchRequest::new(args.resource_type.trim())
            .params(normalize_params(&args.search_params)?);
        request.limit = args.limit;
        request.sort = args.sort.clone();

        let output = if args.wants_count() {
            ToolOutput::Count(self.server.count(&request).await?)
        } else {
            ToolOutput::Records(self.server.search(&request).await?)
        };

        match &output {
            ToolOutput::Count(count) => info!(count = *count, "Returning count of resources"),
            ToolOutput::Records(records) => {
                info!(fetched = records.len(), "Returning fetched resources")
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingServer {
        requests: Mutex<Vec<SearchRequest>>,
    }

    #[async_trait]
    impl RecordServer for RecordingServer {
        async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, FhirError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(vec![json!({"resourceType": request.resource_type, "id": "1"}); 4])
        }

        async fn count(&self, request: &SearchRequest) -> Result<u64, FhirError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(42)
        }

        async fn capability_statement(&self) -> Result<Value, FhirError> {
            Ok(json!({}))
        }
    }

    fn args(raw: Value) -> FetchRecordsArgs {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_require_count_returns_integer() {
        let server = Arc::new(RecordingServer::default());
        let tool = FetchRecordsTool::new(server.clone());

        let output = tool
            .call(&args(json!({
                "resource_type": "Encounter",
                "search_params": {"patient": "abc-123"},
                "limit": 3,
                "require_count": true
            })))
            .await
            .unwrap();

        assert_eq!(output, ToolOutput::Count(42));
        assert_eq!(serde_json::to_value(&output).unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_search_applies_normalized_params_sort_and_limit() {
        let server = Arc::new(RecordingServer::default());
        let tool = FetchRecordsTool::new(server.clone());

        let output = tool
            .call(&args(json!({
                "resource_type": "Patient",
                "search_params": {"birthdate__gt": "1944", "name__contains": "John"},
                "limit": 4,
                "sort": "-_lastUpdated"
            })))
            .await
            .unwrap();

        assert!(matches!(output, ToolOutput::Records(ref r) if r.len() == 4));
        let requests = server.requests.lock().unwrap();
        assert_eq!(
            requests[0].query_string(false),
            "birthdate=gt1944&name:contains=John&_sort=-_lastUpdated&_count=4"
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_errors() {
        let tool = FetchRecordsTool::new(Arc::new(RecordingServer::default()));

        let zero = tool
            .call(&args(json!({"resource_type": "Encounter", "limit": 0})))
            .await
            .unwrap_err();
        assert!(matches!(zero, FhirError::InvalidQuery(_)));

        let nested = tool
            .call(&args(json!({
                "resource_type": "Encounter",
                "search_params": {"patient": {"id": "x"}}
            })))
            .await
            .unwrap_err();
        assert!(matches!(nested, FhirError::InvalidQuery(_)));
    }

    #[test]
    fn test_unknown_argument_is_rejected() {
        let parsed = serde_json::from_value::<FetchRecordsArgs>(json!({
            "resource_type": "Encounter",
            "page": 2
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_definition_names_tool() {
        let definition = FetchRecordsTool::definition();
        assert_eq!(definition["name"], TOOL_NAME);
        assert_eq!(definition["parameters"]["required"], json!(["resource_type"]));
    }
}
