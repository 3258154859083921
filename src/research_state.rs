//! Working memory of a single research run.

use crate::research_log::IterationLog;

/// A bounded excerpt from a page that the relevance filter accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFragment {
    pub url: String,
    pub query: String,
    pub text: String,
}

/// Working memory of a single research run.
///
/// Owned by the driving task and only mutated between fan-in points, so
/// concurrently running link tasks never see it.
#[derive(Debug, Default)]
pub struct ResearchState {
    pub all_search_queries: Vec<String>,
    pub aggregated_contexts: Vec<ContextFragment>,
    pub iteration_count: usize,
    pub log: IterationLog,
}

impl ResearchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch of queries in the run history (duplicates allowed).
    pub fn record_queries(&mut self, queries: &[String]) {
        self.all_search_queries.extend(queries.iter().cloned());
    }

    /// Append fragments in the order they were produced.
    pub fn extend_contexts(&mut self, fragments: Vec<ContextFragment>) {
        self.aggregated_contexts.extend(fragments);
    }

    /// The most recent `n` fragment texts, oldest first.
    pub fn recent_contexts(&self, n: usize) -> Vec<&str> {
        let start = self.aggregated_contexts.len().saturating_sub(n);
        self.aggregated_contexts[start..]
            .iter()
            .map(|f| f.text.as_str())
            .collect()
    }

    pub fn context_texts(&self) -> Vec<&str> {
        self.aggregated_contexts
            .iter()
            .map(|f| f.text.as_str())
            .collect()
    }
}
