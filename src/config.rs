// Configuration helpers - settings, API keys, endpoints and the model catalog
//
// Everything a research run needs is loaded here once and handed to the
// clients at construction time. Nothing in this module is global state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const SERPAPI_URL: &str = "https://serpapi.com/search";
pub const JINA_BASE_URL: &str = "https://r.jina.ai/";

pub const DEFAULT_MODEL: &str = "anthropic/claude-3-sonnet-20240229";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_ITERATIONS: usize = 10;

const OPENROUTER_KEY_VAR: &str = "OPENROUTER_API_KEY";
const SERPAPI_KEY_VAR: &str = "SERPAPI_API_KEY";
const JINA_KEY_VAR: &str = "JINA_API_KEY";

// ============================================================================
// Model Catalog
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostTier {
    VeryLow,
    Low,
    Medium,
    High,
}

impl fmt::Display for CostTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CostTier::VeryLow => "Very Low",
            CostTier::Low => "Low",
            CostTier::Medium => "Medium",
            CostTier::High => "High",
        };
        f.write_str(label)
    }
}

/// The model chosen for a run. Passed unchanged to every completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub id: String,
    pub name: String,
    pub description: String,
    pub max_tokens: u32,
    pub cost: CostTier,
}

impl ModelSelection {
    fn catalog_entry(
        id: &str,
        name: &str,
        description: &str,
        max_tokens: u32,
        cost: CostTier,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            max_tokens,
            cost,
        }
    }

    /// A model that is not in the catalog, e.g. a newer OpenRouter id.
    pub fn custom(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: "Custom model".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            cost: CostTier::Medium,
        }
    }
}

pub fn available_models() -> Vec<ModelSelection> {
    vec![
        ModelSelection::catalog_entry(
            "deepseek-ai/deepseek-llm-67b",
            "DeepSeek R1",
            "High-performance model for deep analysis",
            8192,
            CostTier::High,
        ),
        ModelSelection::catalog_entry(
            "deepseek-ai/deepseek-llm-7b",
            "DeepSeek LLM 7B",
            "Smaller version, efficient for common tasks",
            4096,
            CostTier::Medium,
        ),
        ModelSelection::catalog_entry(
            "qwen/qwen-72b",
            "Qwen 72B",
            "Large-scale model with strong capabilities",
            8192,
            CostTier::High,
        ),
        ModelSelection::catalog_entry(
            "qwen/qwen-14b",
            "Qwen 14B",
            "Balanced performance for cost efficiency",
            4096,
            CostTier::Medium,
        ),
        ModelSelection::catalog_entry(
            "mistral/mistral-7b",
            "Mistral 7B",
            "Lightweight model with strong reasoning skills",
            4096,
            CostTier::Medium,
        ),
        ModelSelection::catalog_entry(
            "mistral/mixtral-8x7b",
            "Mixtral 8x7B",
            "Sparse mixture of experts for optimal balance",
            8192,
            CostTier::High,
        ),
        ModelSelection::catalog_entry(
            "anthropic/claude-3-opus-20240229",
            "Claude 3 Opus",
            "Most capable model, best for complex research",
            4096,
            CostTier::High,
        ),
        ModelSelection::catalog_entry(
            DEFAULT_MODEL,
            "Claude 3 Sonnet",
            "Balanced performance and speed",
            4096,
            CostTier::Medium,
        ),
        ModelSelection::catalog_entry(
            "anthropic/claude-3-haiku-20240229",
            "Claude 3 Haiku",
            "Fastest model, good for quick research",
            4096,
            CostTier::Low,
        ),
        ModelSelection::catalog_entry(
            "openai/gpt-4-turbo-preview",
            "GPT-4 Turbo",
            "Alternative high-capability model",
            4096,
            CostTier::High,
        ),
        ModelSelection::catalog_entry(
            "openai/gpt-3.5-turbo",
            "GPT-3.5 Turbo",
            "Fast and cost-effective",
            4096,
            CostTier::VeryLow,
        ),
    ]
}

/// Look a model up by its OpenRouter id.
pub fn find_model(id: &str) -> Option<ModelSelection> {
    available_models().into_iter().find(|m| m.id == id)
}

// ============================================================================
// Research Depth
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Depth {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl Depth {
    pub fn multiplier(&self) -> f64 {
        match self {
            Depth::Quick => 0.5,
            Depth::Standard => 1.0,
            Depth::Deep => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Quick => "quick",
            Depth::Standard => "standard",
            Depth::Deep => "deep",
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "quick" => Ok(Depth::Quick),
            "standard" => Ok(Depth::Standard),
            "deep" => Ok(Depth::Deep),
            other => Err(format!(
                "Unknown depth '{}'. Use quick, standard or deep",
                other
            )),
        }
    }
}

/// Apply the depth multiplier to a requested iteration count.
/// Truncates toward zero, but a run always gets at least one iteration.
pub fn resolve_iterations(iterations: usize, depth: Depth) -> usize {
    let scaled = (iterations as f64 * depth.multiplier()) as usize;
    scaled.max(1)
}

// ============================================================================
// Research Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub depth: Depth,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_iterations() -> usize {
    DEFAULT_ITERATIONS
}

fn default_max_concurrent_fetches() -> usize {
    16
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            iterations: default_iterations(),
            depth: Depth::default(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ResearchSettings {
    /// Update one setting from its textual key/value form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "model" => self.model = value.trim().to_string(),
            "iterations" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| "Invalid number for iterations")?;
                if n == 0 {
                    return Err("iterations must be at least 1".to_string());
                }
                self.iterations = n;
            }
            "depth" => self.depth = value.parse()?,
            "max_concurrent_fetches" | "concurrency" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| "Invalid number for max_concurrent_fetches")?;
                if n == 0 {
                    return Err("max_concurrent_fetches must be at least 1".to_string());
                }
                self.max_concurrent_fetches = n;
            }
            "request_timeout_secs" | "timeout" => {
                self.request_timeout_secs = value
                    .parse()
                    .map_err(|_| "Invalid number for request_timeout_secs")?;
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

// ============================================================================
// Endpoints & HTTP
// ============================================================================

/// Backend locations and generation defaults handed to each client.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub openrouter_url: String,
    pub serpapi_url: String,
    pub jina_base_url: String,
    pub temperature: f64,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openrouter_url: OPENROUTER_URL.to_string(),
            serpapi_url: SERPAPI_URL.to_string(),
            jina_base_url: JINA_BASE_URL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// Build the HTTP client shared by all three backends of a run.
pub fn build_http_client(settings: &ResearchSettings) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

// ============================================================================
// Paths
// ============================================================================

pub fn get_config_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Could not find home directory".to_string())?;
    Ok(home.join(".openresearch"))
}

pub fn ensure_config_dir() -> Result<PathBuf, String> {
    let config_dir = get_config_dir()?;
    std::fs::create_dir_all(&config_dir)
        .map_err(|e| format!("Failed to create config directory: {}", e))?;
    Ok(config_dir)
}

pub fn get_preferences_path() -> Result<PathBuf, String> {
    Ok(get_config_dir()?.join("preferences.json"))
}

pub fn get_env_file_path() -> Result<PathBuf, String> {
    Ok(get_config_dir()?.join(".env"))
}

pub fn read_settings() -> Result<ResearchSettings, String> {
    let path = get_preferences_path()?;
    if !path.exists() {
        return Ok(ResearchSettings::default());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read settings: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
}

pub fn write_settings(settings: &ResearchSettings) -> Result<(), String> {
    ensure_config_dir()?;
    let path = get_preferences_path()?;
    let content = serde_json::to_string_pretty(&settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    std::fs::write(&path, content).map_err(|e| format!("Failed to write settings: {}", e))
}

// ============================================================================
// API Keys
// ============================================================================

/// The three backends that need a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenRouter,
    SerpApi,
    Jina,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenRouter, Provider::SerpApi, Provider::Jina];

    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::OpenRouter => OPENROUTER_KEY_VAR,
            Provider::SerpApi => SERPAPI_KEY_VAR,
            Provider::Jina => JINA_KEY_VAR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenRouter => "openrouter",
            Provider::SerpApi => "serpapi",
            Provider::Jina => "jina",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" => Ok(Provider::OpenRouter),
            "serpapi" | "serp" => Ok(Provider::SerpApi),
            "jina" => Ok(Provider::Jina),
            other => Err(format!(
                "Unknown provider '{}'. Use openrouter, serpapi or jina",
                other
            )),
        }
    }
}

#[derive(Clone)]
pub struct ApiKeys {
    pub openrouter: String,
    pub serpapi: String,
    pub jina: String,
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field("openrouter", &"<redacted>")
            .field("serpapi", &"<redacted>")
            .field("jina", &"<redacted>")
            .finish()
    }
}

impl ApiKeys {
    /// Load all keys, reporting every missing one at once.
    pub fn load() -> Result<Self, String> {
        let env_content = get_env_file_path()
            .ok()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .unwrap_or_default();

        let lookup = |provider: Provider| {
            std::env::var(provider.env_var())
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| parse_env_value(&env_content, provider.env_var()))
        };

        let openrouter = lookup(Provider::OpenRouter);
        let serpapi = lookup(Provider::SerpApi);
        let jina = lookup(Provider::Jina);

        match (openrouter, serpapi, jina) {
            (Some(openrouter), Some(serpapi), Some(jina)) => Ok(Self {
                openrouter,
                serpapi,
                jina,
            }),
            (openrouter, serpapi, jina) => {
                let missing: Vec<&str> = [
                    (openrouter.is_none(), OPENROUTER_KEY_VAR),
                    (serpapi.is_none(), SERPAPI_KEY_VAR),
                    (jina.is_none(), JINA_KEY_VAR),
                ]
                .iter()
                .filter(|(absent, _)| *absent)
                .map(|(_, name)| *name)
                .collect();
                Err(format!(
                    "Missing required API keys: {}. Set them in the environment or in ~/.openresearch/.env",
                    missing.join(", ")
                ))
            }
        }
    }
}

/// Find `NAME=value` in .env content, stripping optional quotes.
fn parse_env_value(content: &str, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(&prefix))
        .map(|line| {
            line.trim_start_matches(&prefix)
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string()
        })
        .filter(|key| !key.is_empty())
}

pub fn read_api_key(provider: Provider) -> Option<String> {
    if let Ok(value) = std::env::var(provider.env_var()) {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    let env_path = get_env_file_path().ok()?;
    let content = std::fs::read_to_string(env_path).ok()?;
    parse_env_value(&content, provider.env_var())
}

pub fn has_api_key(provider: Provider) -> bool {
    read_api_key(provider).is_some()
}

pub fn validate_api_key(api_key: &str) -> Result<(), String> {
    if api_key.trim().is_empty() {
        return Err("API key cannot be empty".to_string());
    }
    if api_key.contains(char::is_whitespace) {
        return Err("API key must not contain whitespace".to_string());
    }
    Ok(())
}

pub fn write_api_key(provider: Provider, api_key: &str) -> Result<(), String> {
    ensure_config_dir()?;
    let env_path = get_env_file_path()?;
    let existing = std::fs::read_to_string(&env_path).unwrap_or_default();

    let content = upsert_env_line(&existing, provider.env_var(), api_key);
    std::fs::write(&env_path, content)
        .map_err(|e| format!("Failed to write .env file: {}", e))?;

    // Owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(&env_path, permissions);
    }

    Ok(())
}

pub fn delete_api_key(provider: Provider) -> Result<(), String> {
    let env_path = get_env_file_path()?;
    if !env_path.exists() {
        return Ok(());
    }

    let content = std::fs::read_to_string(&env_path)
        .map_err(|e| format!("Failed to read .env file: {}", e))?;
    let remaining = remove_env_line(&content, provider.env_var());

    if remaining.trim().is_empty() {
        let _ = std::fs::remove_file(&env_path);
        Ok(())
    } else {
        std::fs::write(&env_path, remaining)
            .map_err(|e| format!("Failed to update .env file: {}", e))
    }
}

/// Replace `NAME=...` in place, or append it, preserving other lines.
fn upsert_env_line(content: &str, name: &str, value: &str) -> String {
    let prefix = format!("{}=", name);
    let mut updated = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.trim().starts_with(&prefix) {
                updated = true;
                format!("{}{}", prefix, value)
            } else {
                line.to_string()
            }
        })
        .collect();

    if !updated {
        lines.push(format!("{}{}", prefix, value));
    }
    lines.join("\n") + "\n"
}

fn remove_env_line(content: &str, name: &str) -> String {
    let prefix = format!("{}=", name);
    let lines: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim().starts_with(&prefix))
        .collect();
    if lines.is_empty() {
        String::new()
    } else {
        lines.join("\n") + "\n"
    }
}
