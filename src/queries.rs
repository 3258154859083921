//! Search query synthesis.
//!
//! Two shapes of the same completion request: the initial batch derived from
//! the user's question, and follow-up batches derived from what has been
//! found so far. Model output is parsed with a strict JSON-array parser that
//! fails closed to an empty list.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::completion::{ChatMessage, CompletionBackend};
use crate::config::ModelSelection;

/// Marker the model returns when no further research is needed.
pub const COMPLETION_MARKER: &str = "COMPLETE";

pub const MAX_INITIAL_QUERIES: usize = 4;
pub const MAX_REFINED_QUERIES: usize = 2;

pub(crate) const INITIAL_SYSTEM_PROMPT: &str =
    "You are a helpful and precise research assistant.";

pub(crate) const REFINE_SYSTEM_PROMPT: &str = "You are a research query generator. \
Respond with either a JSON array of new search queries or the single word COMPLETE if no more research is needed.";

lazy_static! {
    static ref FENCED_BLOCK: Option<Regex> = Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").ok();
    static ref BRACKETED: Option<Regex> = Regex::new(r"(?s)\[.*\]").ok();
}

/// Outcome of a follow-up query request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refinement {
    /// The model signalled that the research is complete.
    Complete,
    /// More research is warranted with these queries.
    Queries(Vec<String>),
    /// Nothing usable came back.
    Exhausted,
}

/// Parse a JSON array of strings out of model output.
///
/// Accepts the array on its own, inside a fenced code block, or embedded in
/// surrounding prose. Blank entries are dropped and at most `limit` queries
/// are kept. Anything else yields an empty list.
pub fn parse_query_list(response: &str, limit: usize) -> Vec<String> {
    let trimmed = response.trim();

    let candidates = std::iter::once(trimmed)
        .chain(
            FENCED_BLOCK
                .as_ref()
                .and_then(|re| re.captures(trimmed))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str()),
        )
        .chain(
            BRACKETED
                .as_ref()
                .and_then(|re| re.find(trimmed))
                .map(|m| m.as_str()),
        );

    for candidate in candidates {
        if let Ok(queries) = serde_json::from_str::<Vec<String>>(candidate) {
            return queries
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .take(limit)
                .collect();
        }
    }

    debug!("Could not parse query list from response: {}", trimmed);
    Vec::new()
}

/// Ask the model for the first batch of search queries.
pub async fn initial_queries(
    completion: &dyn CompletionBackend,
    model: &ModelSelection,
    user_query: &str,
) -> Vec<String> {
    let prompt = format!(
        "User Query: {}\n\n\
         You are an expert research assistant. Given the user's query, generate up to {} distinct, \
         precise search queries that would help gather complete information on the topic. \
         Return only a JSON array of strings, for example: [\"query1\", \"query2\", \"query3\"].",
        user_query, MAX_INITIAL_QUERIES
    );
    let messages = [
        ChatMessage::system(INITIAL_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ];

    match completion.complete(&messages, model).await {
        Some(response) => {
            let queries = parse_query_list(&response, MAX_INITIAL_QUERIES);
            if queries.is_empty() {
                warn!("Initial query response was not a usable list");
            }
            queries
        }
        None => Vec::new(),
    }
}

/// Decide whether to keep researching, given the history and latest findings.
///
/// `recent_findings` is the recency window chosen by the caller. When it is
/// empty nothing has been found in the whole run and the model is not asked.
pub async fn next_queries(
    completion: &dyn CompletionBackend,
    model: &ModelSelection,
    user_query: &str,
    previous_queries: &[String],
    recent_findings: &[&str],
) -> Refinement {
    if recent_findings.is_empty() {
        return Refinement::Exhausted;
    }

    let history = serde_json::to_string(previous_queries).unwrap_or_default();
    let prompt = format!(
        "Based on the findings so far and the original query, determine if more research is needed. \
         If yes, generate up to {} new search queries that would help fill gaps in our research, \
         as a JSON array of strings. If no, respond with {}.\n\n\
         Original Query: {}\n\n\
         Previous Queries: {}\n\n\
         Recent Findings:\n{}",
        MAX_REFINED_QUERIES,
        COMPLETION_MARKER,
        user_query,
        history,
        recent_findings.join("\n")
    );
    let messages = [
        ChatMessage::system(REFINE_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ];

    let Some(response) = completion.complete(&messages, model).await else {
        return Refinement::Exhausted;
    };

    if response.contains(COMPLETION_MARKER) {
        return Refinement::Complete;
    }

    let queries = parse_query_list(&response, MAX_REFINED_QUERIES);
    if queries.is_empty() {
        Refinement::Exhausted
    } else {
        Refinement::Queries(queries)
    }
}
