use async_trait::async_trait;
use roxmltree::{Document, Node, ParsingOptions};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RetrieverSettings;
use crate::models::EvidenceDocument;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const NO_ABSTRACT: &str = "No abstract available";

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("PubMed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("PubMed returned status {0}")]
    Status(u16),

    #[error("Unexpected PubMed response: {0}")]
    Malformed(String),
}

/// Literature search.
#[async_trait]
pub trait EvidenceRetriever: Send + Sync {
    /// Documents relevant to `query`, best match first.
    async fn relevant_documents(&self, query: &str) -> Result<Vec<EvidenceDocument>, EvidenceError>;
}

/// PubMed search over the NCBI E-utilities (esearch for ids, efetch for abstracts).
#[derive(Debug, Clone)]
pub struct PubMedRetriever {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    top_k: usize,
}

impl PubMedRetriever {
    pub fn new(settings: &RetrieverSettings) -> Result<Self, EvidenceError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            top_k: settings.top_k_results,
        })
    }

    fn search_url(&self, query: &str) -> String {
        format!(
            "{}/esearch.fcgi?db=pubmed&term={}&retmode=json&retmax={}&sort=relevance&api_key={}",
            self.base_url,
            urlencoding::encode(query),
            self.top_k,
            urlencoding::encode(&self.api_key)
        )
    }

    fn fetch_url(&self, ids: &[String]) -> String {
        format!(
            "{}/efetch.fcgi?db=pubmed&id={}&retmode=xml&api_key={}",
            self.base_url,
            ids.join(","),
            urlencoding::encode(&self.api_key)
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, EvidenceError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(EvidenceError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl EvidenceRetriever for PubMedRetriever {
    async fn relevant_documents(&self, query: &str) -> Result<Vec<EvidenceDocument>, EvidenceError> {
        if self.top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let search: Value = self.get(&self.search_url(query)).await?.json().await?;
        let ids = search_ids(&search)?;
        info!(found = ids.len(), "PubMed search completed");

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let xml = self.get(&self.fetch_url(&ids)).await?.text().await?;
        let mut documents = parse_pubmed_xml(&xml)?;
        documents.truncate(self.top_k);

        debug!(documents = documents.len(), "PubMed articles fetched");
        Ok(documents)
    }
}

fn search_ids(search: &Value) -> Result<Vec<String>, EvidenceError> {
    search
        .pointer("/esearchresult/idlist")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| EvidenceError::Malformed("esearch result has no idlist".to_string()))
}

/// Pull id, title, publication date and abstract out of an efetch XML payload.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<EvidenceDocument>, EvidenceError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(xml, options)
        .map_err(|e| EvidenceError::Malformed(format!("efetch XML: {}", e)))?;

    Ok(doc
        .descendants()
        .filter(|node| node.has_tag_name("PubmedArticle"))
        .filter_map(article)
        .collect())
}

fn article(node: Node) -> Option<EvidenceDocument> {
    let id = first(node, "PMID").map(node_text).filter(|id| !id.is_empty())?;
    let title = first(node, "ArticleTitle").map(node_text).unwrap_or_default();

    let abstract_parts: Vec<String> = node
        .descendants()
        .filter(|n| n.has_tag_name("AbstractText"))
        .map(node_text)
        .filter(|text| !text.is_empty())
        .collect();
    let content = if abstract_parts.is_empty() {
        NO_ABSTRACT.to_string()
    } else {
        abstract_parts.join("\n")
    };

    let published = first(node, "PubDate").map(publication_date).unwrap_or_default();

    Some(EvidenceDocument {
        id,
        title,
        published,
        content,
    })
}

fn publication_date(pub_date: Node) -> String {
    let parts: Vec<String> = ["Year", "Month", "Day"]
        .iter()
        .filter_map(|tag| first(pub_date, tag).map(node_text))
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        first(pub_date, "MedlineDate").map(node_text).unwrap_or_default()
    } else {
        parts.join("-")
    }
}

fn first<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.descendants().find(|n| n.has_tag_name(tag))
}

/// All text under `node`, inline markup dropped and whitespace collapsed.
fn node_text(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
