//! Language model access through a rig OpenRouter agent, for both single
//! completions and streamed chats.

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream::BoxStream};
use rig::agent::{Agent, MultiTurnStreamItem};
use rig::client::CompletionClient;
use rig::completion::{Chat, Message};
use rig::providers::openrouter;
use rig::streaming::StreamingChat;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::ModelSettings;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("LLM stream failed: {0}")]
    Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One prior message in a conversation with the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    fn to_rig_message(&self) -> Message {
        match self.role {
            MessageRole::User => Message::user(self.content.clone()),
            MessageRole::Assistant => Message::assistant(self.content.clone()),
        }
    }
}

/// A single generation call: instructions, prior turns and the new prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub preamble: String,
    pub history: Vec<ChatTurn>,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(preamble: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            preamble: preamble.into(),
            history: Vec::new(),
            prompt: prompt.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    fn rig_history(&self) -> Vec<Message> {
        self.history.iter().map(ChatTurn::to_rig_message).collect()
    }
}

/// Incremental text fragments, in generation order.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError>;
}

/// OpenRouter-hosted chat model.
pub struct OpenRouterModel {
    client: openrouter::Client,
    settings: ModelSettings,
}

impl OpenRouterModel {
    pub fn new(settings: &ModelSettings) -> Result<Self, LlmError> {
        if settings.api_key.trim().is_empty() {
            return Err(LlmError::Request("OPENROUTER_API_KEY not set".to_string()));
        }

        let client = openrouter::Client::builder(&settings.api_key)
            .base_url(&settings.api_base)
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }

    fn agent(&self, preamble: &str) -> Agent<openrouter::CompletionModel> {
        self.client
            .agent(&self.settings.model_id)
            .preamble(preamble)
            .temperature(self.settings.temperature)
            .max_tokens(self.settings.max_tokens)
            .build()
    }
}

#[async_trait]
impl LanguageModel for OpenRouterModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let agent = self.agent(&request.preamble);

        let response = agent
            .chat(request.prompt.clone(), request.rig_history())
            .await
            .map_err(|e| {
                error!(error = %e, "LLM chat failed");
                LlmError::Request(e.to_string())
            })?;

        if response.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(response)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, LlmError> {
        let agent = self.agent(&request.preamble);
        let items = agent
            .stream_chat(request.prompt.clone(), request.rig_history())
            .await;

        Ok(text_fragments(items))
    }
}

/// Keep the text chunks of a streamed chat, ending at the first error.
pub fn text_fragments<S, E>(items: S) -> TextStream
where
    S: Stream<Item = Result<MultiTurnStreamItem, E>> + Send + 'static,
    E: Display,
{
    items
        .map(|item| match item {
            Ok(MultiTurnStreamItem::Text(text)) if !text.text.is_empty() => Some(Ok(text.text)),
            Ok(MultiTurnStreamItem::Text(_)) | Ok(MultiTurnStreamItem::FinalResponse(_)) => None,
            Err(e) => {
                error!(error = %e, "LLM stream failed");
                Some(Err(LlmError::Stream(e.to_string())))
            }
        })
        .filter_map(futures::future::ready)
        .scan(false, |failed, item| {
            let next = if *failed { None } else { Some(item) };
            if let Some(Err(_)) = &next {
                *failed = true;
            }
            futures::future::ready(next)
        })
        .inspect(|item| {
            if let Ok(fragment) = item {
                debug!(fragment_len = fragment.len(), "Streamed fragment");
            }
        })
        .boxed()
}

/// Strip markdown fences and surrounding chatter from a model's JSON answer.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed)
        .trim();

    if unfenced.starts_with('{') || unfenced.starts_with('[') {
        return unfenced;
    }

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}
