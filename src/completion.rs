//! Completion client for the OpenRouter chat completions API.
//!
//! Every call collapses to `Option<String>`: a transport error, a non-success
//! status or an unexpected body is logged and reported as `None`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{Endpoints, ModelSelection};
use crate::research_log::{parse_api_error, ErrorCode, ResearchError};

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A language-model backend that turns a conversation into text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], model: &ModelSelection) -> Option<String>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull `choices[0].message.content` out of a response body.
fn extract_completion_text(body: &str) -> Result<String, ResearchError> {
    let response: CompletionResponse = serde_json::from_str(body).map_err(|e| {
        ResearchError::new(
            ErrorCode::ParseError,
            format!("Failed to parse completion response: {}", e),
        )
    })?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| {
            ResearchError::new(
                ErrorCode::InvalidResponse,
                "Completion response contained no message content",
            )
        })
}

/// OpenRouter-backed completion client.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    endpoint: String,
    temperature: f64,
}

impl OpenRouterClient {
    pub fn new(client: Client, api_key: impl Into<String>, endpoints: &Endpoints) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoints.openrouter_url.clone(),
            temperature: endpoints.temperature,
        }
    }

    async fn send_request(
        &self,
        messages: &[ChatMessage],
        model: &ModelSelection,
    ) -> Result<String, ResearchError> {
        let request = CompletionRequest {
            model: &model.id,
            messages,
            temperature: self.temperature,
            max_tokens: model.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Open Research Assistant")
            .json(&request)
            .send()
            .await
            .map_err(|e| ResearchError::from_transport("Completion", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ResearchError::from_transport("Completion", &e))?;

        if !status.is_success() {
            let err = parse_api_error(status.as_u16(), &body);
            if err.requires_user_action {
                error!("USER ACTION REQUIRED: {}", err.user_message);
            }
            return Err(err);
        }

        extract_completion_text(&body)
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterClient {
    async fn complete(&self, messages: &[ChatMessage], model: &ModelSelection) -> Option<String> {
        let started = Instant::now();
        match self.send_request(messages, model).await {
            Ok(text) => {
                debug!(
                    "Completion from {} in {}ms ({} chars)",
                    model.id,
                    started.elapsed().as_millis(),
                    text.len()
                );
                Some(text)
            }
            Err(e) => {
                warn!(
                    "Completion call to {} failed (code: {}): {}",
                    model.id,
                    e.code.as_str(),
                    e.message
                );
                None
            }
        }
    }
}
