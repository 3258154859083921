//! Final report synthesis.

use crate::completion::{ChatMessage, CompletionBackend};
use crate::config::ModelSelection;

pub(crate) const SYSTEM_PROMPT: &str = "You are a professional research report writer.";

/// Returned in place of a report when the completion call fails.
pub const REPORT_FALLBACK: &str = "Error generating final report.";

/// Turn every accumulated finding into one prose report.
pub async fn generate_report(
    completion: &dyn CompletionBackend,
    model: &ModelSelection,
    user_query: &str,
    contexts: &[&str],
) -> String {
    let prompt = format!(
        "Based on the following research findings, generate a comprehensive report that addresses \
         the user's query. Include key insights and maintain a professional tone.\n\n\
         User Query: {}\n\nResearch Findings:\n{}",
        user_query,
        contexts.join("\n\n")
    );
    let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

    completion
        .complete(&messages, model)
        .await
        .filter(|report| !report.trim().is_empty())
        .unwrap_or_else(|| REPORT_FALLBACK.to_string())
}
