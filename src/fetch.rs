//! Content fetch client for the Jina reader service.
//!
//! The reader turns any public URL into plain text. Failures come back as an
//! empty string, which callers treat as "nothing fetched".

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Endpoints;
use crate::research_log::{parse_api_error, ResearchError};

/// A backend that extracts readable text from a web page.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> String;
}

/// Keep at most `max_chars` characters, never splitting a UTF-8 sequence.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

pub struct JinaReader {
    client: Client,
    api_key: String,
    base_url: String,
}

impl JinaReader {
    pub fn new(client: Client, api_key: impl Into<String>, endpoints: &Endpoints) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: endpoints.jina_base_url.clone(),
        }
    }

    async fn send_request(&self, url: &str) -> Result<String, ResearchError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ResearchError::from_transport("Fetch", &e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ResearchError::from_transport("Fetch", &e))?;

        if !status.is_success() {
            return Err(parse_api_error(status.as_u16(), &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl ContentFetcher for JinaReader {
    async fn fetch_text(&self, url: &str) -> String {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            warn!("Refusing to fetch non-HTTP URL: {}", url);
            return String::new();
        }

        match self.send_request(url).await {
            Ok(text) => {
                debug!("Fetched {} ({} chars)", url, text.len());
                text
            }
            Err(e) => {
                warn!("Fetch of {} failed: {}", url, e);
                String::new()
            }
        }
    }
}
