//! Search client for SerpAPI.
//!
//! Returns the organic result links for a query, in rank order. Any failure
//! yields an empty list.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Endpoints;
use crate::research_log::{parse_api_error, ErrorCode, ResearchError};

/// Search engine selector sent with every request.
const SEARCH_ENGINE: &str = "google";

/// A web search backend that maps a query to result URLs.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Vec<String>;
}

/// Collect `organic_results[*].link`, skipping records without a link.
fn extract_links(body: &Value) -> Vec<String> {
    body.get("organic_results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|item| item.get("link").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct SerpApiClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl SerpApiClient {
    pub fn new(client: Client, api_key: impl Into<String>, endpoints: &Endpoints) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoints.serpapi_url.clone(),
        }
    }

    async fn send_request(&self, query: &str) -> Result<Vec<String>, ResearchError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("api_key", self.api_key.as_str()),
                ("engine", SEARCH_ENGINE),
            ])
            .send()
            .await
            .map_err(|e| ResearchError::from_transport("Search", &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(parse_api_error(status.as_u16(), &body));
        }

        let body: Value = response.json().await.map_err(|e| {
            ResearchError::new(
                ErrorCode::ParseError,
                format!("Failed to parse search response: {}", e),
            )
        })?;

        Ok(extract_links(&body))
    }
}

#[async_trait]
impl SearchBackend for SerpApiClient {
    async fn search(&self, query: &str) -> Vec<String> {
        match self.send_request(query).await {
            Ok(links) => {
                debug!("Search '{}' returned {} links", query, links.len());
                links
            }
            Err(e) => {
                warn!("Search for '{}' failed: {}", query, e);
                Vec::new()
            }
        }
    }
}
