use async_trait::async_trait;
use reqwest::{StatusCode, header};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::query::{QuerySyntaxError, SearchParam, render_query_string};
use crate::config::FhirSettings;

/// Upper bound on Bundle pages followed for one search.
pub const MAX_PAGES: usize = 10;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FHIR_JSON: &str = "application/fhir+json";

#[derive(Debug, Error)]
pub enum FhirError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Multiple resources found: {0}")]
    MultipleResourcesFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Record server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<QuerySyntaxError> for FhirError {
    fn from(err: QuerySyntaxError) -> Self {
        FhirError::InvalidQuery(err.to_string())
    }
}

/// A search against one resource type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub resource_type: String,
    pub params: Vec<SearchParam>,
    pub limit: Option<usize>,
    pub sort: Option<String>,
}

impl SearchRequest {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(SearchParam::new(key, value));
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = SearchParam>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    /// Query string for the first page. Count-only requests ask for `_summary=count`.
    pub fn query_string(&self, count_only: bool) -> String {
        let mut params = self.params.clone();
        if let Some(sort) = self.sort.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            params.push(SearchParam::new("_sort", sort.replace(' ', "")));
        }
        if count_only {
            params.push(SearchParam::new("_summary", "count"));
        } else if let Some(limit) = self.limit {
            params.push(SearchParam::new("_count", limit.to_string()));
        }
        render_query_string(&params)
    }

    fn describe(&self) -> String {
        format!("{}?{}", self.resource_type, render_query_string(&self.params))
    }
}

/// The record server as seen by the rest of the service.
#[async_trait]
pub trait RecordServer: Send + Sync {
    /// Matching resources, following pagination until `limit` is met.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, FhirError>;

    /// Number of matching resources, without fetching them.
    async fn count(&self, request: &SearchRequest) -> Result<u64, FhirError>;

    /// The server's CapabilityStatement.
    async fn capability_statement(&self) -> Result<Value, FhirError>;

    /// Exactly one matching resource.
    async fn search_one(&self, request: &SearchRequest) -> Result<Value, FhirError> {
        let mut bounded = request.clone();
        bounded.limit = Some(2);

        let mut found = self.search(&bounded).await?;
        match found.len() {
            0 => Err(FhirError::NotFound(request.describe())),
            1 => Ok(found.remove(0)),
            _ => Err(FhirError::MultipleResourcesFound(request.describe())),
        }
    }
}

/// REST client for a FHIR R4 server.
#[derive(Debug, Clone)]
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
}

impl FhirClient {
    pub fn new(settings: &FhirSettings) -> Result<Self, FhirError> {
        let base_url = settings.api_base.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(FhirError::InvalidUrl(base_url));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(FHIR_JSON));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(settings.app_id.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, base_url })
    }

    /// Build the client and make sure the server answers before serving traffic.
    pub async fn connect(settings: &FhirSettings) -> Result<Self, FhirError> {
        let client = Self::new(settings)?;
        let capability = client.capability_statement().await?;
        let fhir_version = capability
            .get("fhirVersion")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        info!(
            base_url = %client.base_url,
            fhir_version = %fhir_version,
            "FHIR server is ready"
        );
        Ok(client)
    }

    fn search_url(&self, request: &SearchRequest, count_only: bool) -> String {
        format!(
            "{}/{}?{}",
            self.base_url,
            request.resource_type,
            request.query_string(count_only)
        )
    }
}

/// Fetches one JSON document (a Bundle page or a CapabilityStatement) by URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value, FhirError>;
}

#[async_trait]
impl PageFetcher for FhirClient {
    async fn fetch(&self, url: &str) -> Result<Value, FhirError> {
        debug!(url = %url, "FHIR GET");
        let response = self.http.get(url).send().await?;
        handle_response(response).await
    }
}

/// Follow `next` links from `first_url`, stopping at `limit` resources or [`MAX_PAGES`] pages.
pub async fn collect_pages(
    fetcher: &dyn PageFetcher,
    first_url: String,
    limit: Option<usize>,
) -> Result<Vec<Value>, FhirError> {
    let mut url = first_url;
    let mut resources = Vec::new();

    for page in 1..=MAX_PAGES {
        let bundle = fetcher.fetch(&url).await?;
        resources.extend(bundle_resources(&bundle));

        if let Some(limit) = limit.filter(|limit| resources.len() >= *limit) {
            resources.truncate(limit);
            break;
        }

        match next_link(&bundle) {
            Some(next) => url = next,
            None => break,
        }

        if page == MAX_PAGES {
            warn!(pages = MAX_PAGES, "Stopped following search pages at the page cap");
        }
    }

    Ok(resources)
}

/// The `total` of a `_summary=count` Bundle.
pub fn bundle_total(bundle: &Value) -> Result<u64, FhirError> {
    bundle
        .get("total")
        .and_then(Value::as_u64)
        .ok_or_else(|| FhirError::Server {
            status: 200,
            body: "count response has no total".to_string(),
        })
}

#[async_trait]
impl RecordServer for FhirClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Value>, FhirError> {
        check_resource_type(&request.resource_type)?;

        let resources = collect_pages(self, self.search_url(request, false), request.limit).await?;

        debug!(
            resource_type = %request.resource_type,
            fetched = resources.len(),
            "FHIR search completed"
        );
        Ok(resources)
    }

    async fn count(&self, request: &SearchRequest) -> Result<u64, FhirError> {
        check_resource_type(&request.resource_type)?;

        let bundle = self.fetch(&self.search_url(request, true)).await?;
        bundle_total(&bundle)
    }

    async fn capability_statement(&self) -> Result<Value, FhirError> {
        let url = format!("{}/metadata", self.base_url);
        self.fetch(&url).await
    }
}

async fn handle_response(response: reqwest::Response) -> Result<Value, FhirError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(error_for_status(status, body))
}

fn error_for_status(status: StatusCode, body: String) -> FhirError {
    match status {
        StatusCode::UNAUTHORIZED => FhirError::Unauthorized(body),
        StatusCode::FORBIDDEN => FhirError::PermissionDenied(body),
        StatusCode::NOT_FOUND | StatusCode::GONE => FhirError::NotFound(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => FhirError::InvalidQuery(body),
        other => FhirError::Server {
            status: other.as_u16(),
            body,
        },
    }
}

/// Resources carried in a searchset Bundle's entries.
pub fn bundle_resources(bundle: &Value) -> Vec<Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry.pointer("/search/mode").and_then(Value::as_str) != Some("outcome")
                })
                .filter_map(|entry| entry.get("resource").cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// URL of the Bundle's `next` page, if any.
pub fn next_link(bundle: &Value) -> Option<String> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url").and_then(Value::as_str))
        .map(str::to_string)
}

fn check_resource_type(resource_type: &str) -> Result<(), FhirError> {
    let mut chars = resource_type.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(FhirError::InvalidQuery(format!(
            "'{}' is not a resource type",
            resource_type
        )))
    }
}
