//! Page relevance classification.

use tracing::debug;

use crate::completion::{ChatMessage, CompletionBackend};
use crate::config::ModelSelection;
use crate::fetch::truncate_chars;

/// Characters of page text shown to the evaluator.
pub const FILTER_MAX_CHARS: usize = 20_000;

pub(crate) const SYSTEM_PROMPT: &str =
    "You are a strict and concise evaluator of research relevance.";

const INSTRUCTION: &str = "You are a critical research evaluator. Given the user's query and the content of a webpage, \
determine if the webpage contains information that is useful for addressing the query. \
Respond with exactly one word: 'Yes' if the page is useful, or 'No' if it is not.";

/// Ask the model whether `page_text` helps answer `user_query`.
///
/// Any response containing "Yes" counts as useful, so "Yes, partially" passes
/// and "No" or a failed call does not.
pub async fn is_page_useful(
    completion: &dyn CompletionBackend,
    model: &ModelSelection,
    user_query: &str,
    page_text: &str,
) -> bool {
    let prompt = format!(
        "User Query: {}\n\nWebpage Content:\n{}\n\n{}",
        user_query,
        truncate_chars(page_text, FILTER_MAX_CHARS),
        INSTRUCTION
    );
    let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];

    match completion.complete(&messages, model).await {
        Some(response) => {
            debug!("Relevance verdict: {}", response.trim());
            response.contains("Yes")
        }
        None => false,
    }
}
