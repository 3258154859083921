//! The iterative research loop.
//!
//! A run asks the model for search queries, fans the batch out to the search
//! backend, fetches and filters every unique link, and then asks the model
//! whether to keep going. When the loop stops, every accepted fragment is
//! handed to report synthesis.
//!
//! All network-bound work runs cooperatively inside the driving task. Link
//! tasks only return values; the driver folds them into [`ResearchState`]
//! after each fan-in, so the state never needs a lock.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinError;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::completion::{CompletionBackend, OpenRouterClient};
use crate::config::{
    build_http_client, find_model, read_settings, resolve_iterations, ApiKeys, Depth, Endpoints,
    ModelSelection, ResearchSettings,
};
use crate::dedup::{dedup_links, DiscoveredLink};
use crate::fetch::{truncate_chars, ContentFetcher, JinaReader};
use crate::queries::{self, Refinement};
use crate::relevance;
use crate::report;
use crate::research_state::{ContextFragment, ResearchState};
use crate::search::{SearchBackend, SerpApiClient};

/// Characters of an accepted page kept as context.
pub const CONTEXT_MAX_CHARS: usize = 10_000;

/// Number of most recent fragments shown to the convergence check.
pub const RECENT_CONTEXT_WINDOW: usize = 2;

pub const NO_QUERIES_REPORT: &str = "No search queries were generated.";
pub const NO_QUERIES_LOG: &str = "Error: No initial queries generated.";

const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 16;

// ============================================================================
// Progress Events
// ============================================================================

/// A timestamped progress notification from a running research loop.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchEvent {
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: ResearchEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResearchEventKind {
    Started {
        run_id: String,
        query: String,
        iteration_limit: usize,
    },
    QueriesGenerated {
        queries: Vec<String>,
        initial: bool,
    },
    IterationStarted {
        iteration: usize,
        iteration_limit: usize,
    },
    LinksAggregated {
        iteration: usize,
        unique_links: usize,
    },
    LinkProcessed {
        url: String,
        status: LinkStatus,
    },
    IterationFinished {
        iteration: usize,
        new_contexts: usize,
        total_contexts: usize,
    },
    Converged {
        reason: StopReason,
    },
    SynthesisStarted {
        contexts: usize,
    },
    Completed {
        run_id: String,
        iterations: usize,
        contexts: usize,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    FetchFailed,
    Irrelevant,
    Useful,
}

/// Why the loop stopped before report synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model said no more research is needed.
    Done,
    /// The convergence check produced nothing usable.
    Exhausted,
    IterationLimit,
}

/// Helper to get current timestamp in RFC3339 format
fn get_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ============================================================================
// Research Agent
// ============================================================================

/// Result of one link task, folded into the state by the driver.
enum LinkOutcome {
    FetchFailed(DiscoveredLink),
    Irrelevant(DiscoveredLink),
    Useful(ContextFragment),
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub report: String,
    pub log: String,
    pub queries: Vec<String>,
    pub contexts: Vec<ContextFragment>,
    pub iterations: usize,
    pub stop_reason: Option<StopReason>,
}

pub struct ResearchAgent {
    completion: Arc<dyn CompletionBackend>,
    search: Arc<dyn SearchBackend>,
    fetcher: Arc<dyn ContentFetcher>,
    model: ModelSelection,
    max_concurrent_fetches: usize,
    progress: Option<UnboundedSender<ResearchEvent>>,
}

impl ResearchAgent {
    pub fn new(
        completion: Arc<dyn CompletionBackend>,
        search: Arc<dyn SearchBackend>,
        fetcher: Arc<dyn ContentFetcher>,
        model: ModelSelection,
    ) -> Self {
        Self {
            completion,
            search,
            fetcher,
            model,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            progress: None,
        }
    }

    /// Wire the production backends (OpenRouter, SerpAPI, Jina) over one
    /// shared HTTP client.
    pub fn from_config(
        keys: &ApiKeys,
        settings: &ResearchSettings,
        model: ModelSelection,
    ) -> Result<Self, String> {
        let client = build_http_client(settings)?;
        let endpoints = Endpoints::default();

        let agent = Self::new(
            Arc::new(OpenRouterClient::new(
                client.clone(),
                &keys.openrouter,
                &endpoints,
            )),
            Arc::new(SerpApiClient::new(client.clone(), &keys.serpapi, &endpoints)),
            Arc::new(JinaReader::new(client, &keys.jina, &endpoints)),
            model,
        );
        Ok(agent.with_max_concurrent_fetches(settings.max_concurrent_fetches))
    }

    pub fn with_max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = limit.max(1);
        self
    }

    pub fn with_progress(mut self, tx: UnboundedSender<ResearchEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn emit(&self, kind: ResearchEventKind) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ResearchEvent {
                timestamp: get_timestamp(),
                kind,
            });
        }
    }

    /// Research `query` for at most `iteration_limit` iterations and
    /// synthesize a report from whatever was found.
    pub async fn run(&self, query: &str, iteration_limit: usize) -> ResearchOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("research", run_id = %run_id, model = %self.model.id);
        self.drive(query, iteration_limit, run_id)
            .instrument(span)
            .await
    }

    async fn drive(&self, query: &str, iteration_limit: usize, run_id: String) -> ResearchOutcome {
        let started = Instant::now();
        info!(
            "Starting research (limit {} iterations): {}",
            iteration_limit, query
        );
        self.emit(ResearchEventKind::Started {
            run_id: run_id.clone(),
            query: query.to_string(),
            iteration_limit,
        });

        let mut batch = queries::initial_queries(&*self.completion, &self.model, query).await;
        if batch.is_empty() {
            warn!("No initial queries generated, ending run");
            return ResearchOutcome {
                report: NO_QUERIES_REPORT.to_string(),
                log: NO_QUERIES_LOG.to_string(),
                queries: Vec::new(),
                contexts: Vec::new(),
                iterations: 0,
                stop_reason: None,
            };
        }

        let mut state = ResearchState::new();
        state.record_queries(&batch);
        state.log.push_list("🔍 Initial Search Queries:", &batch);
        self.emit(ResearchEventKind::QueriesGenerated {
            queries: batch.clone(),
            initial: true,
        });

        let mut stop_reason = StopReason::IterationLimit;
        let mut iterations_run = 0;

        while state.iteration_count < iteration_limit {
            let iteration = state.iteration_count + 1;
            state.log.push(format!("\n=== Iteration {} ===", iteration));
            self.emit(ResearchEventKind::IterationStarted {
                iteration,
                iteration_limit,
            });

            let links = self.discover_links(&batch).await;
            state.log.push(format!(
                "📚 Aggregated {} unique links from this iteration.",
                links.len()
            ));
            self.emit(ResearchEventKind::LinksAggregated {
                iteration,
                unique_links: links.len(),
            });

            let outcomes: Vec<LinkOutcome> = stream::iter(links)
                .map(|link| self.process_link(query, link))
                .buffer_unordered(self.max_concurrent_fetches)
                .collect()
                .await;

            let mut found = Vec::new();
            for outcome in outcomes {
                let (url, status) = match outcome {
                    LinkOutcome::FetchFailed(link) => {
                        state
                            .log
                            .push(format!("❌ Failed to fetch content from: {}", link.url));
                        (link.url, LinkStatus::FetchFailed)
                    }
                    LinkOutcome::Irrelevant(link) => {
                        state
                            .log
                            .push(format!("⛔ Content not relevant from: {}", link.url));
                        (link.url, LinkStatus::Irrelevant)
                    }
                    LinkOutcome::Useful(fragment) => {
                        state
                            .log
                            .push(format!("✅ Found useful content from: {}", fragment.url));
                        state.log.push(format!("   Query used: {}", fragment.query));
                        let url = fragment.url.clone();
                        found.push(fragment);
                        (url, LinkStatus::Useful)
                    }
                };
                self.emit(ResearchEventKind::LinkProcessed { url, status });
            }

            let new_contexts = found.len();
            if found.is_empty() {
                state
                    .log
                    .push("⚠️ No useful contexts were found in this iteration.");
            } else {
                state.log.push(format!(
                    "✨ Found {} useful contexts in this iteration.",
                    new_contexts
                ));
            }
            state.extend_contexts(found);
            iterations_run = iteration;
            info!(
                "Iteration {}/{} finished: {} new contexts ({} total)",
                iteration,
                iteration_limit,
                new_contexts,
                state.aggregated_contexts.len()
            );
            self.emit(ResearchEventKind::IterationFinished {
                iteration,
                new_contexts,
                total_contexts: state.aggregated_contexts.len(),
            });

            let refinement = queries::next_queries(
                &*self.completion,
                &self.model,
                query,
                &state.all_search_queries,
                &state.recent_contexts(RECENT_CONTEXT_WINDOW),
            )
            .await;

            match refinement {
                Refinement::Complete => {
                    state
                        .log
                        .push("🎯 LLM indicated that no further research is needed.");
                    stop_reason = StopReason::Done;
                    break;
                }
                Refinement::Queries(next) => {
                    state.log.push_list("🔄 New search queries generated:", &next);
                    state.record_queries(&next);
                    self.emit(ResearchEventKind::QueriesGenerated {
                        queries: next.clone(),
                        initial: false,
                    });
                    batch = next;
                }
                Refinement::Exhausted => {
                    state
                        .log
                        .push("⚡ No new search queries provided. Ending the loop.");
                    stop_reason = StopReason::Exhausted;
                    break;
                }
            }

            state.iteration_count += 1;
        }

        if stop_reason == StopReason::IterationLimit {
            state.log.push("🏁 Iteration limit reached.");
        }

        info!("Research loop stopped: {:?}", stop_reason);
        self.emit(ResearchEventKind::Converged {
            reason: stop_reason,
        });

        state.log.push("\n📝 Generating final report...");
        self.emit(ResearchEventKind::SynthesisStarted {
            contexts: state.aggregated_contexts.len(),
        });
        let report = report::generate_report(
            &*self.completion,
            &self.model,
            query,
            &state.context_texts(),
        )
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Research complete in {}ms: {} iterations, {} contexts",
            duration_ms,
            iterations_run,
            state.aggregated_contexts.len()
        );
        self.emit(ResearchEventKind::Completed {
            run_id,
            iterations: iterations_run,
            contexts: state.aggregated_contexts.len(),
            duration_ms,
        });

        ResearchOutcome {
            report,
            log: state.log.render(),
            queries: state.all_search_queries,
            contexts: state.aggregated_contexts,
            iterations: iterations_run,
            stop_reason: Some(stop_reason),
        }
    }

    /// Search every query of the batch concurrently and merge the results.
    async fn discover_links(&self, batch: &[String]) -> Vec<DiscoveredLink> {
        let searches = batch.iter().map(|q| async move {
            let links = self.search.search(q).await;
            (q.as_str(), links)
        });
        // join_all keeps batch order, which first-seen-wins relies on
        let results = join_all(searches).await;
        dedup_links(&results)
    }

    async fn process_link(&self, user_query: &str, link: DiscoveredLink) -> LinkOutcome {
        let text = self.fetcher.fetch_text(&link.url).await;
        if text.is_empty() {
            debug!("Empty fetch for {}", link.url);
            return LinkOutcome::FetchFailed(link);
        }

        if !relevance::is_page_useful(&*self.completion, &self.model, user_query, &text).await {
            return LinkOutcome::Irrelevant(link);
        }

        LinkOutcome::Useful(ContextFragment {
            text: truncate_chars(&text, CONTEXT_MAX_CHARS).to_string(),
            url: link.url,
            query: link.query,
        })
    }
}

// ============================================================================
// Invocation Boundary
// ============================================================================

/// A research request as submitted by a front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    pub model_id: String,
    pub iterations: usize,
    #[serde(default)]
    pub depth: Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Complete,
    Error,
}

impl fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResearchStatus::Complete => write!(f, "Status: Research Complete"),
            ResearchStatus::Error => write!(f, "Status: Error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResearchResponse {
    pub report: String,
    pub log: String,
    pub status: ResearchStatus,
}

impl ResearchResponse {
    fn failed(message: impl fmt::Display) -> Self {
        let text = format!("An error occurred: {}", message);
        Self {
            report: text.clone(),
            log: text,
            status: ResearchStatus::Error,
        }
    }
}

/// Validate a request and resolve its model and depth-adjusted iteration count.
pub fn resolve_request(request: &ResearchRequest) -> Result<(ModelSelection, usize), String> {
    if request.query.trim().is_empty() {
        return Err("Research query must not be empty".to_string());
    }
    let model = find_model(&request.model_id)
        .ok_or_else(|| format!("Unknown model: {}", request.model_id))?;
    Ok((model, resolve_iterations(request.iterations, request.depth)))
}

/// Run a request end to end against the configured backends.
///
/// Never fails: configuration problems and panics inside the run come back
/// as an error response whose report and log carry the same message.
pub async fn process_research(
    request: ResearchRequest,
    progress: Option<UnboundedSender<ResearchEvent>>,
) -> ResearchResponse {
    let prepared = resolve_request(&request).and_then(|(model, iterations)| {
        let settings = read_settings()?;
        let keys = ApiKeys::load()?;
        let agent = ResearchAgent::from_config(&keys, &settings, model)?;
        Ok((agent, iterations))
    });

    match prepared {
        Ok((agent, iterations)) => {
            let agent = match progress {
                Some(tx) => agent.with_progress(tx),
                None => agent,
            };
            run_to_response(agent, request.query, iterations).await
        }
        Err(e) => {
            error!("Research request rejected: {}", e);
            ResearchResponse::failed(e)
        }
    }
}

/// Run `agent` on its own task and map the outcome to a response.
pub async fn run_to_response(
    agent: ResearchAgent,
    query: String,
    iterations: usize,
) -> ResearchResponse {
    let handle = tokio::spawn(async move { agent.run(&query, iterations).await });

    match handle.await {
        Ok(outcome) => ResearchResponse {
            report: outcome.report,
            log: outcome.log,
            status: ResearchStatus::Complete,
        },
        Err(e) => {
            let message = join_error_message(e);
            error!("Research task failed: {}", message);
            ResearchResponse::failed(message)
        }
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "research task panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ChatMessage;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Completion backend that answers by system prompt and records each call.
    struct ScriptedCompletion {
        initial: Option<String>,
        refinements: Mutex<VecDeque<String>>,
        refine_fallback: Option<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedCompletion {
        fn new(initial: Option<&str>) -> Self {
            Self {
                initial: initial.map(str::to_string),
                refinements: Mutex::new(VecDeque::new()),
                refine_fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn refine_with(self, replies: &[&str]) -> Self {
            *self.refinements.lock().unwrap() = replies.iter().map(|r| r.to_string()).collect();
            self
        }

        fn refine_always(mut self, reply: &str) -> Self {
            self.refine_fallback = Some(reply.to_string());
            self
        }

        fn prompts_for(&self, system: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == system)
                .map(|(_, user)| user.clone())
                .collect()
        }

        fn count(&self, system: &str) -> usize {
            self.prompts_for(system).len()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedCompletion {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _model: &ModelSelection,
        ) -> Option<String> {
            let system = messages[0].content.clone();
            let user = messages[1].content.clone();
            self.calls.lock().unwrap().push((system.clone(), user.clone()));

            if system == queries::INITIAL_SYSTEM_PROMPT {
                self.initial.clone()
            } else if system == queries::REFINE_SYSTEM_PROMPT {
                self.refinements
                    .lock()
                    .unwrap()
                    .pop_front()
                    .or_else(|| self.refine_fallback.clone())
            } else if system == relevance::SYSTEM_PROMPT {
                let verdict = if user.contains("relevant text") { "Yes" } else { "No" };
                Some(verdict.to_string())
            } else if system == report::SYSTEM_PROMPT {
                Some("FINAL REPORT".to_string())
            } else {
                None
            }
        }
    }

    struct MapSearch {
        results: HashMap<String, Vec<String>>,
        queries: Mutex<Vec<String>>,
    }

    impl MapSearch {
        fn new(results: &[(&str, Vec<&str>)]) -> Self {
            Self {
                results: results
                    .iter()
                    .map(|(q, links)| (q.to_string(), links.iter().map(|l| l.to_string()).collect()))
                    .collect(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchBackend for MapSearch {
        async fn search(&self, query: &str) -> Vec<String> {
            self.queries.lock().unwrap().push(query.to_string());
            self.results.get(query).cloned().unwrap_or_default()
        }
    }

    struct MapFetcher {
        pages: HashMap<String, String>,
        fetched: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                fetched: Mutex::new(Vec::new()),
            }
        }

        fn fetched_sorted(&self) -> Vec<String> {
            let mut urls = self.fetched.lock().unwrap().clone();
            urls.sort();
            urls
        }
    }

    #[async_trait]
    impl ContentFetcher for MapFetcher {
        async fn fetch_text(&self, url: &str) -> String {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages.get(url).cloned().unwrap_or_default()
        }
    }

    fn agent(
        completion: &Arc<ScriptedCompletion>,
        search: &Arc<MapSearch>,
        fetcher: &Arc<MapFetcher>,
    ) -> ResearchAgent {
        ResearchAgent::new(
            completion.clone(),
            search.clone(),
            fetcher.clone(),
            ModelSelection::custom("test/model"),
        )
    }

    fn context_urls(outcome: &ResearchOutcome) -> Vec<String> {
        let mut urls: Vec<String> = outcome.contexts.iter().map(|c| c.url.clone()).collect();
        urls.sort();
        urls
    }

    #[tokio::test]
    async fn test_single_iteration_end_to_end() {
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1", "u2"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text"), ("u2", "")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 1).await;

        assert_eq!(outcome.contexts.len(), 1);
        assert_eq!(outcome.contexts[0].url, "u1");
        assert_eq!(outcome.contexts[0].query, "q1");
        assert_eq!(outcome.contexts[0].text, "relevant text");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.stop_reason, Some(StopReason::Exhausted));

        assert_eq!(completion.count(queries::INITIAL_SYSTEM_PROMPT), 1);
        assert_eq!(completion.count(relevance::SYSTEM_PROMPT), 1);
        assert_eq!(completion.count(queries::REFINE_SYSTEM_PROMPT), 1);
        let reports = completion.prompts_for(report::SYSTEM_PROMPT);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].ends_with("Research Findings:\nrelevant text"));

        assert_eq!(outcome.report, "FINAL REPORT");
        assert_eq!(fetcher.fetched_sorted(), vec!["u1", "u2"]);
        assert!(outcome.log.starts_with("🔍 Initial Search Queries:\n   • q1"));
        assert!(outcome.log.contains("📚 Aggregated 2 unique links from this iteration."));
        assert!(outcome.log.contains("❌ Failed to fetch content from: u2"));
        assert!(outcome.log.contains("✅ Found useful content from: u1\n   Query used: q1"));
        assert!(outcome.log.contains("✨ Found 1 useful contexts in this iteration."));
        assert!(outcome
            .log
            .contains("⚡ No new search queries provided. Ending the loop."));
        assert!(outcome.log.ends_with("\n📝 Generating final report..."));
    }

    #[tokio::test]
    async fn test_no_initial_queries_short_circuits() {
        let completion = Arc::new(ScriptedCompletion::new(Some("I cannot help with that.")));
        let search = Arc::new(MapSearch::new(&[]));
        let fetcher = Arc::new(MapFetcher::new(&[]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 5).await;

        assert_eq!(outcome.report, NO_QUERIES_REPORT);
        assert_eq!(outcome.log, NO_QUERIES_LOG);
        assert_eq!(outcome.iterations, 0);
        assert!(search.queries.lock().unwrap().is_empty());
        assert!(fetcher.fetched.lock().unwrap().is_empty());
        assert_eq!(completion.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_signal_stops_loop() {
        let completion =
            Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)).refine_with(&["COMPLETE"]));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 5).await;

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.stop_reason, Some(StopReason::Done));
        assert_eq!(completion.count(queries::REFINE_SYSTEM_PROMPT), 1);
        assert_eq!(search.queries.lock().unwrap().len(), 1);
        assert!(outcome
            .log
            .contains("🎯 LLM indicated that no further research is needed."));
        assert_eq!(completion.count(report::SYSTEM_PROMPT), 1);
    }

    #[tokio::test]
    async fn test_refinement_feeds_next_iteration() {
        let completion = Arc::new(
            ScriptedCompletion::new(Some(r#"["q1"]"#)).refine_with(&[r#"["q2"]"#, "COMPLETE"]),
        );
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"]), ("q2", vec!["u2", "u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[
            ("u1", "relevant text one"),
            ("u2", "relevant text two"),
        ]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 5).await;

        assert_eq!(outcome.queries, vec!["q1", "q2"]);
        assert_eq!(*search.queries.lock().unwrap(), vec!["q1", "q2"]);
        assert_eq!(outcome.iterations, 2);
        // Links are only deduplicated within an iteration
        assert_eq!(context_urls(&outcome), vec!["u1", "u1", "u2"]);
        assert!(outcome.log.contains("🔄 New search queries generated:\n   • q2"));

        let refine_prompts = completion.prompts_for(queries::REFINE_SYSTEM_PROMPT);
        assert_eq!(refine_prompts.len(), 2);
        assert!(refine_prompts[0].contains(r#"Previous Queries: ["q1"]"#));
        assert!(refine_prompts[1].contains(r#"Previous Queries: ["q1","q2"]"#));
    }

    #[tokio::test]
    async fn test_recent_findings_window_is_last_two() {
        let completion =
            Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)).refine_with(&["COMPLETE"]));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1", "u2", "u3"])]));
        let fetcher = Arc::new(MapFetcher::new(&[
            ("u1", "relevant text A"),
            ("u2", "relevant text B"),
            ("u3", "relevant text C"),
        ]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 3).await;
        assert_eq!(outcome.contexts.len(), 3);

        let prompt = &completion.prompts_for(queries::REFINE_SYSTEM_PROMPT)[0];
        let findings = prompt
            .split("Recent Findings:\n")
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let expected: Vec<&str> = outcome.contexts[1..]
            .iter()
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(findings, expected.join("\n"));
    }

    #[tokio::test]
    async fn test_iteration_cap_checks_convergence_every_iteration() {
        let completion = Arc::new(
            ScriptedCompletion::new(Some(r#"["q1"]"#)).refine_always(r#"["q1"]"#),
        );
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 3).await;

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.stop_reason, Some(StopReason::IterationLimit));
        assert_eq!(search.queries.lock().unwrap().len(), 3);
        assert_eq!(completion.count(queries::REFINE_SYSTEM_PROMPT), 3);
        // The last batch is recorded but never searched
        assert_eq!(outcome.queries.len(), 4);
        assert!(outcome.log.contains("=== Iteration 3 ==="));
        assert!(!outcome.log.contains("=== Iteration 4 ==="));
        assert!(outcome.log.contains("🏁 Iteration limit reached."));
    }

    #[tokio::test]
    async fn test_complete_on_final_iteration_is_logged_as_done() {
        let completion =
            Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)).refine_with(&["COMPLETE"]));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 1).await;

        assert_eq!(completion.count(queries::REFINE_SYSTEM_PROMPT), 1);
        assert_eq!(outcome.stop_reason, Some(StopReason::Done));
        assert!(outcome
            .log
            .contains("🎯 LLM indicated that no further research is needed."));
        assert!(!outcome.log.contains("🏁"));
    }

    #[tokio::test]
    async fn test_empty_search_does_not_affect_sibling_queries() {
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["a", "unknown"]"#)));
        let search = Arc::new(MapSearch::new(&[("a", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 1).await;

        let mut searched = search.queries.lock().unwrap().clone();
        searched.sort();
        assert_eq!(searched, vec!["a", "unknown"]);
        assert_eq!(outcome.contexts.len(), 1);
        assert_eq!(outcome.contexts[0].url, "u1");
        assert_eq!(outcome.contexts[0].query, "a");
        assert!(outcome.log.contains("📚 Aggregated 1 unique links from this iteration."));
    }

    #[tokio::test]
    async fn test_duplicate_links_processed_once_per_iteration() {
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["a", "b"]"#)));
        let search = Arc::new(MapSearch::new(&[("a", vec!["u1", "u2"]), ("b", vec!["u2", "u3"])]));
        let fetcher = Arc::new(MapFetcher::new(&[
            ("u1", "relevant text 1"),
            ("u2", "relevant text 2"),
            ("u3", "relevant text 3"),
        ]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 1).await;

        assert_eq!(fetcher.fetched_sorted(), vec!["u1", "u2", "u3"]);
        assert_eq!(completion.count(relevance::SYSTEM_PROMPT), 3);
        assert_eq!(context_urls(&outcome), vec!["u1", "u2", "u3"]);
        let u2 = outcome.contexts.iter().find(|c| c.url == "u2");
        assert_eq!(u2.map(|c| c.query.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn test_no_contexts_ends_without_refinement_call() {
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1", "u2"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", ""), ("u2", "off-topic page")]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 5).await;

        assert!(outcome.contexts.is_empty());
        assert_eq!(outcome.stop_reason, Some(StopReason::Exhausted));
        // Only the non-empty page reaches the filter
        assert_eq!(completion.count(relevance::SYSTEM_PROMPT), 1);
        assert_eq!(completion.count(queries::REFINE_SYSTEM_PROMPT), 0);
        assert_eq!(completion.count(report::SYSTEM_PROMPT), 1);
        assert!(outcome.log.contains("⛔ Content not relevant from: u2"));
        assert!(outcome
            .log
            .contains("⚠️ No useful contexts were found in this iteration."));
        assert!(outcome
            .log
            .contains("⚡ No new search queries provided. Ending the loop."));
    }

    #[tokio::test]
    async fn test_fragment_truncated_to_context_limit() {
        let long_page = format!("relevant text {}", "z".repeat(CONTEXT_MAX_CHARS * 2));
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", long_page.as_str())]));

        let outcome = agent(&completion, &search, &fetcher).run("X", 1).await;

        assert_eq!(outcome.contexts.len(), 1);
        assert_eq!(outcome.contexts[0].text.chars().count(), CONTEXT_MAX_CHARS);
        assert!(long_page.starts_with(&outcome.contexts[0].text));
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1", "u2"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text"), ("u2", "")]));

        agent(&completion, &search, &fetcher)
            .with_progress(tx)
            .run("X", 1)
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(
            events.first().map(|e| &e.kind),
            Some(ResearchEventKind::Started { .. })
        ));
        assert!(matches!(
            events.last().map(|e| &e.kind),
            Some(ResearchEventKind::Completed { contexts: 1, .. })
        ));
        let mut statuses: Vec<(String, LinkStatus)> = events
            .iter()
            .filter_map(|e| match &e.kind {
                ResearchEventKind::LinkProcessed { url, status } => Some((url.clone(), *status)),
                _ => None,
            })
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            statuses,
            vec![
                ("u1".to_string(), LinkStatus::Useful),
                ("u2".to_string(), LinkStatus::FetchFailed)
            ]
        );

        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(json["query"], "X");
        assert!(json["timestamp"].as_str().is_some());
    }

    struct PanickingCompletion;

    #[async_trait]
    impl CompletionBackend for PanickingCompletion {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _model: &ModelSelection,
        ) -> Option<String> {
            panic!("backend exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let agent = ResearchAgent::new(
            Arc::new(PanickingCompletion),
            Arc::new(MapSearch::new(&[])),
            Arc::new(MapFetcher::new(&[])),
            ModelSelection::custom("test/model"),
        );

        let response = run_to_response(agent, "X".to_string(), 1).await;

        assert_eq!(response.status, ResearchStatus::Error);
        assert_eq!(response.report, "An error occurred: backend exploded");
        assert_eq!(response.report, response.log);
    }

    #[tokio::test]
    async fn test_successful_response() {
        let completion = Arc::new(ScriptedCompletion::new(Some(r#"["q1"]"#)));
        let search = Arc::new(MapSearch::new(&[("q1", vec!["u1"])]));
        let fetcher = Arc::new(MapFetcher::new(&[("u1", "relevant text")]));

        let response =
            run_to_response(agent(&completion, &search, &fetcher), "X".to_string(), 1).await;

        assert_eq!(response.status, ResearchStatus::Complete);
        assert_eq!(response.report, "FINAL REPORT");
        assert!(!response.report.contains("An error occurred"));
        assert!(response.log.contains("=== Iteration 1 ==="));
    }

    #[test]
    fn test_resolve_request() {
        let request = ResearchRequest {
            query: "What is X?".to_string(),
            model_id: crate::config::DEFAULT_MODEL.to_string(),
            iterations: 10,
            depth: Depth::Quick,
        };
        let (model, iterations) = resolve_request(&request).unwrap();
        assert_eq!(model.id, crate::config::DEFAULT_MODEL);
        assert_eq!(iterations, 5);

        let deep = ResearchRequest {
            depth: Depth::Deep,
            ..request.clone()
        };
        assert_eq!(resolve_request(&deep).unwrap().1, 20);
    }

    #[test]
    fn test_resolve_request_rejects_bad_input() {
        let blank = ResearchRequest {
            query: "   ".to_string(),
            model_id: crate::config::DEFAULT_MODEL.to_string(),
            iterations: 10,
            depth: Depth::Standard,
        };
        assert!(resolve_request(&blank).is_err());

        let unknown = ResearchRequest {
            query: "X".to_string(),
            model_id: "nobody/nothing".to_string(),
            ..blank
        };
        let err = resolve_request(&unknown).unwrap_err();
        assert!(err.contains("nobody/nothing"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            ResearchStatus::Complete.to_string(),
            "Status: Research Complete"
        );
        assert_eq!(ResearchStatus::Error.to_string(), "Status: Error");
    }
}
