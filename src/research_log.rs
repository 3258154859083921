//! Research logging module.
//!
//! Provides structured error types, backend error parsing, and the
//! append-only iteration log that is returned to the caller with the report.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Error Types
// ============================================================================

/// Categorized error codes for research operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Backend errors (user action may be required)
    InvalidApiKey,
    BudgetExceeded,
    RateLimited,
    ApiOverloaded,

    // Network errors
    NetworkError,
    Timeout,

    // Data errors
    ParseError,
    InvalidResponse,

    // Setup errors
    Configuration,

    // Internal errors
    InternalError,
    Unknown,
}

impl ErrorCode {
    /// Returns true if this error requires user action to resolve.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidApiKey | ErrorCode::BudgetExceeded | ErrorCode::Configuration
        )
    }

    /// Get a user-friendly message for this error code.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidApiKey => {
                "An API key is invalid or has been revoked. Check your keys with `openresearch config api-key show`."
            }
            ErrorCode::BudgetExceeded => {
                "Your account has run out of credits. Add credits with the provider and try again."
            }
            ErrorCode::RateLimited => {
                "Too many requests. Wait a moment and try again."
            }
            ErrorCode::ApiOverloaded => {
                "The backend is currently overloaded or unavailable. Try again later."
            }
            ErrorCode::NetworkError => {
                "Network error occurred. Please check your internet connection."
            }
            ErrorCode::Timeout => "The request timed out. Please try again.",
            ErrorCode::ParseError => {
                "Failed to parse the response. This is usually a temporary issue."
            }
            ErrorCode::InvalidResponse => "Received an invalid response from the backend.",
            ErrorCode::Configuration => {
                "The research agent is not configured correctly. Check your settings and API keys."
            }
            ErrorCode::InternalError => {
                "An internal error occurred. Please try again or report this issue."
            }
            ErrorCode::Unknown => "An unknown error occurred. Please try again.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidApiKey => "invalid_api_key",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ApiOverloaded => "api_overloaded",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ParseError => "parse_error",
            ErrorCode::InvalidResponse => "invalid_response",
            ErrorCode::Configuration => "configuration",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::Unknown => "unknown",
        }
    }
}

/// A structured research error with user-friendly messaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchError {
    pub code: ErrorCode,
    pub message: String,
    pub user_message: String,
    pub requires_user_action: bool,
    pub details: Option<String>,
}

impl ResearchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let user_message = code.user_message().to_string();
        let requires_user_action = code.requires_user_action();
        Self {
            code,
            message: message.into(),
            user_message,
            requires_user_action,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Classify a transport failure from reqwest.
    pub fn from_transport(context: &str, err: &reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else if err.is_decode() {
            ErrorCode::ParseError
        } else {
            ErrorCode::NetworkError
        };
        Self::new(code, format!("{} request failed: {}", context, err))
    }
}

impl fmt::Display for ResearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ResearchError {}

// ============================================================================
// Backend Error Parsing
// ============================================================================

/// Error body shape shared by OpenRouter (`{"error": {"code", "message"}}`)
/// and SerpAPI (`{"error": "..."}`).
#[derive(Debug, Deserialize)]
struct BackendErrorBody {
    error: Option<BackendErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BackendErrorDetail {
    Structured {
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
    },
    Plain(String),
}

fn code_for_status(status_code: u16) -> ErrorCode {
    match status_code {
        401 | 403 => ErrorCode::InvalidApiKey,
        402 => ErrorCode::BudgetExceeded,
        408 => ErrorCode::Timeout,
        429 => ErrorCode::RateLimited,
        500..=599 => ErrorCode::ApiOverloaded,
        _ => ErrorCode::Unknown,
    }
}

/// Parse an HTTP status code and response body into a structured error.
pub fn parse_api_error(status_code: u16, body: &str) -> ResearchError {
    if let Ok(BackendErrorBody {
        error: Some(detail),
    }) = serde_json::from_str::<BackendErrorBody>(body)
    {
        let (embedded_status, message) = match detail {
            BackendErrorDetail::Structured { code, message } => (
                code.as_ref().and_then(|c| c.as_u64()).map(|c| c as u16),
                message.unwrap_or_else(|| body.to_string()),
            ),
            BackendErrorDetail::Plain(message) => (None, message),
        };

        let lower = message.to_lowercase();
        let code = if lower.contains("credit") || lower.contains("quota") {
            ErrorCode::BudgetExceeded
        } else if lower.contains("invalid api key") || lower.contains("no auth") {
            ErrorCode::InvalidApiKey
        } else {
            code_for_status(embedded_status.unwrap_or(status_code))
        };

        return ResearchError::new(code, message).with_details(body.to_string());
    }

    ResearchError::new(
        code_for_status(status_code),
        format!("HTTP {}: {}", status_code, truncate_string(body, 500)),
    )
    .with_details(body.to_string())
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

// ============================================================================
// Iteration Log
// ============================================================================

/// Human-readable record of one research run.
///
/// Entries are only ever appended; the log lives exactly as long as the run
/// and is rendered as a single newline-joined string at the end.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationLog {
    entries: Vec<String>,
}

impl IterationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        self.entries.push(entry.into());
    }

    /// Append a heading followed by one bullet per item.
    pub fn push_list<I, S>(&mut self, heading: impl Into<String>, items: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push(heading);
        for item in items {
            self.push(format!("   • {}", item.as_ref()));
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        self.entries.join("\n")
    }
}

impl fmt::Display for IterationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
