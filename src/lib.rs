// OpenResearch Library - iterative web research agent
//
// This module exports the research loop, its three backend clients and the
// configuration layer shared with the CLI.

pub mod completion;
pub mod config;
pub mod dedup;
pub mod fetch;
pub mod queries;
pub mod relevance;
pub mod report;
pub mod research;
pub mod research_log;
pub mod research_state;
pub mod search;

// Re-export key types for convenience
pub use completion::{ChatMessage, CompletionBackend, OpenRouterClient};
pub use config::{
    available_models, delete_api_key, ensure_config_dir, find_model, get_config_dir, has_api_key,
    read_api_key, read_settings, resolve_iterations, validate_api_key, write_api_key,
    write_settings, ApiKeys, CostTier, Depth, ModelSelection, Provider, ResearchSettings,
};
pub use fetch::{ContentFetcher, JinaReader};
pub use research::{
    process_research, ResearchAgent, ResearchEvent, ResearchEventKind, ResearchOutcome,
    ResearchRequest, ResearchResponse, ResearchStatus,
};
pub use research_log::{ErrorCode, IterationLog, ResearchError};
pub use research_state::{ContextFragment, ResearchState};
pub use search::{SearchBackend, SerpApiClient};
