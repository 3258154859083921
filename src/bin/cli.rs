// OpenResearch CLI - Command-line interface for the iterative research agent
//
// Usage: openresearch <command> [options]

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use scopeguard::defer;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use openresearch::research::{LinkStatus, StopReason};
use openresearch::{
    available_models, delete_api_key, find_model, get_config_dir, has_api_key, process_research,
    read_settings, validate_api_key, write_api_key, write_settings, Depth, Provider,
    ResearchEvent, ResearchEventKind, ResearchRequest, ResearchStatus,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Helper to safely serialize JSON for output. Returns error JSON if serialization fails.
fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"JSON serialization failed: {}\"}}", e))
}

#[derive(Parser)]
#[command(
    name = "openresearch",
    version = VERSION,
    about = "Iterative research agent - searches, reads and reports on any question",
    long_about = None
)]
struct Cli {
    /// Output as JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// Show debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Research a question and print the report
    Research {
        /// The question to research
        query: String,
        /// OpenRouter model id (see `models list`)
        #[arg(short, long)]
        model: Option<String>,
        /// Maximum research iterations before depth is applied
        #[arg(short, long)]
        iterations: Option<usize>,
        /// Research depth: quick, standard or deep
        #[arg(short, long)]
        depth: Option<Depth>,
        /// Save the report as Markdown to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the iteration log after the report
        #[arg(long)]
        show_log: bool,
    },

    /// Browse the model catalog
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// List available models
    List,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Setting key (model, iterations, depth, max_concurrent_fetches, request_timeout_secs)
        key: String,
        /// Value to set
        value: String,
    },
    /// Manage API keys
    #[command(name = "api-key")]
    ApiKey {
        #[command(subcommand)]
        action: ApiKeyAction,
    },
}

#[derive(Subcommand)]
enum ApiKeyAction {
    /// Check which API keys are set
    Show,
    /// Set an API key
    Set {
        /// Provider: openrouter, serpapi or jina
        provider: Provider,
        /// The API key
        key: String,
    },
    /// Clear an API key
    Clear {
        /// Provider: openrouter, serpapi or jina
        provider: Provider,
    },
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Research {
            query,
            model,
            iterations,
            depth,
            output,
            show_log,
        } => {
            let options = ResearchOptions {
                model,
                iterations,
                depth,
                output,
                show_log,
            };
            handle_research(query, options, cli.json).await
        }
        Commands::Models { action } => handle_models(action, cli.json),
        Commands::Config { action } => handle_config(action, cli.json),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

// ============================================================================
// Research Handler
// ============================================================================

struct ResearchOptions {
    model: Option<String>,
    iterations: Option<usize>,
    depth: Option<Depth>,
    output: Option<PathBuf>,
    show_log: bool,
}

async fn handle_research(query: String, options: ResearchOptions, json: bool) -> Result<(), String> {
    let settings = read_settings().unwrap_or_default();

    let request = ResearchRequest {
        query: query.clone(),
        model_id: options.model.unwrap_or_else(|| settings.model.clone()),
        iterations: options.iterations.unwrap_or(settings.iterations),
        depth: options.depth.unwrap_or(settings.depth),
    };

    if !json {
        println!("{} Researching: {}", "→".cyan(), query.bold());
        println!(
            "  Model: {}  Iterations: {}  Depth: {}",
            request.model_id.cyan(),
            request.iterations,
            request.depth
        );
    }

    // Progress is only rendered in text mode
    let (progress, printer) = if json {
        (None, None)
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(tx), Some(tokio::spawn(print_progress(rx))))
    };

    let abort = printer.as_ref().map(|handle| handle.abort_handle());
    defer! {
        if let Some(handle) = &abort {
            handle.abort();
        }
    }

    let response = process_research(request.clone(), progress).await;

    // The sender is gone once the run ends, so the printer drains and exits
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let saved_to = match (&options.output, response.status) {
        (Some(path), ResearchStatus::Complete) => {
            save_report(path, &query, &request.model_id, &response.report)?;
            Some(path.display().to_string())
        }
        _ => None,
    };

    if json {
        println!(
            "{}",
            to_json(&serde_json::json!({
                "status": response.status,
                "query": query,
                "model": request.model_id,
                "report": response.report,
                "log": response.log,
                "saved_to": saved_to,
            }))
        );
    } else if response.status == ResearchStatus::Complete {
        println!();
        println!("{}", response.status.to_string().green().bold());
        println!();
        println!("{}", "Research Report".bold());
        println!("{}", "─".repeat(60).dimmed());
        println!("{}", response.report);

        if options.show_log {
            println!();
            println!("{}", "Research Log".bold());
            println!("{}", "─".repeat(60).dimmed());
            println!("{}", response.log);
        }

        if let Some(path) = &saved_to {
            println!();
            println!("{} Report saved to {}", "✓".green(), path);
        }
    } else {
        println!("{}", response.status.to_string().red().bold());
    }

    match response.status {
        ResearchStatus::Complete => Ok(()),
        ResearchStatus::Error => Err(response.report),
    }
}

async fn print_progress(mut rx: UnboundedReceiver<ResearchEvent>) {
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }
}

fn print_event(event: &ResearchEvent) {
    match &event.kind {
        ResearchEventKind::Started { .. } => {}
        ResearchEventKind::QueriesGenerated { queries, initial } => {
            let label = if *initial { "Search queries" } else { "New search queries" };
            println!("{} {}:", "→".cyan(), label);
            for q in queries {
                println!("  • {}", q.dimmed());
            }
        }
        ResearchEventKind::IterationStarted {
            iteration,
            iteration_limit,
        } => {
            println!();
            println!(
                "{} {}",
                "→".cyan(),
                format!("Iteration {}/{}", iteration, iteration_limit).bold()
            );
        }
        ResearchEventKind::LinksAggregated { unique_links, .. } => {
            println!("  {} unique links", unique_links.to_string().cyan());
        }
        ResearchEventKind::LinkProcessed { url, status } => {
            let mark = match status {
                LinkStatus::Useful => "✓".green(),
                LinkStatus::Irrelevant => "○".dimmed(),
                LinkStatus::FetchFailed => "✗".red(),
            };
            println!("  {} {}", mark, url.dimmed());
        }
        ResearchEventKind::IterationFinished {
            new_contexts,
            total_contexts,
            ..
        } => {
            println!(
                "  {} useful pages ({} total)",
                new_contexts.to_string().cyan(),
                total_contexts
            );
        }
        ResearchEventKind::Converged { reason } => {
            let message = match reason {
                StopReason::Done => "Research converged",
                StopReason::Exhausted => "No further queries suggested",
                StopReason::IterationLimit => "Iteration limit reached",
            };
            println!();
            println!("{} {}", "→".cyan(), message);
        }
        ResearchEventKind::SynthesisStarted { contexts } => {
            println!("{} Writing report from {} pages...", "→".cyan(), contexts);
        }
        ResearchEventKind::Completed { duration_ms, .. } => {
            println!(
                "{} Finished in {:.1}s",
                "✓".green(),
                *duration_ms as f64 / 1000.0
            );
        }
    }
}

fn save_report(path: &Path, query: &str, model_id: &str, report: &str) -> Result<(), String> {
    let content = format!(
        "# Research Report\n\n\
         **Query:** {}\n\n\
         **Model:** {}\n\n\
         **Generated:** {}\n\n\
         ---\n\n\
         {}\n",
        query,
        model_id,
        chrono::Local::now().format("%Y-%m-%d %H:%M"),
        report
    );
    std::fs::write(path, content).map_err(|e| format!("Failed to save report: {}", e))
}

// ============================================================================
// Models Handler
// ============================================================================

fn handle_models(action: ModelAction, json: bool) -> Result<(), String> {
    match action {
        ModelAction::List => {
            let models = available_models();
            let current = read_settings().unwrap_or_default().model;

            if json {
                println!("{}", to_json(&models));
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "Name", "Cost", "Max Tokens", "Description"]);

            for model in &models {
                let id = if model.id == current {
                    format!("{} {}", model.id, "(current)".green())
                } else {
                    model.id.clone()
                };
                table.add_row(vec![
                    id,
                    model.name.clone(),
                    model.cost.to_string(),
                    model.max_tokens.to_string(),
                    model.description.clone(),
                ]);
            }

            println!("{table}");
        }
    }

    Ok(())
}

// ============================================================================
// Config Handler
// ============================================================================

fn handle_config(action: ConfigAction, json: bool) -> Result<(), String> {
    match action {
        ConfigAction::Show => {
            let settings = read_settings().unwrap_or_default();
            let config_dir = get_config_dir()?;

            if json {
                let keys: serde_json::Map<String, serde_json::Value> = Provider::ALL
                    .iter()
                    .map(|p| (p.as_str().to_string(), has_api_key(*p).into()))
                    .collect();
                println!(
                    "{}",
                    to_json(&serde_json::json!({
                        "config_dir": config_dir.display().to_string(),
                        "api_keys": keys,
                        "settings": settings,
                    }))
                );
            } else {
                println!("{}", "Configuration".bold());
                println!();
                println!(
                    "  Config directory: {}",
                    config_dir.display().to_string().dimmed()
                );
                for provider in Provider::ALL {
                    println!("  {} key: {}", provider.as_str(), key_status(provider));
                }
                println!();
                println!("{}", "Research Settings".bold());
                println!();
                println!("  Model: {}", settings.model.cyan());
                println!("  Iterations: {}", settings.iterations);
                println!("  Depth: {}", settings.depth);
                println!(
                    "  Max concurrent fetches: {}",
                    settings.max_concurrent_fetches
                );
                println!("  Request timeout: {}s", settings.request_timeout_secs);
            }
        }

        ConfigAction::Set { key, value } => {
            let mut settings = read_settings().unwrap_or_default();
            settings.set(&key, &value)?;
            write_settings(&settings)?;

            if json {
                println!("{}", serde_json::json!({ "updated": key, "value": value }));
            } else {
                println!("{} Set {} = {}", "✓".green(), key, value);
                if key == "model" && find_model(&settings.model).is_none() {
                    println!(
                        "{} '{}' is not in the model catalog; research runs will reject it",
                        "!".yellow(),
                        settings.model
                    );
                }
            }
        }

        ConfigAction::ApiKey { action } => match action {
            ApiKeyAction::Show => {
                if json {
                    let keys: serde_json::Map<String, serde_json::Value> = Provider::ALL
                        .iter()
                        .map(|p| (p.as_str().to_string(), has_api_key(*p).into()))
                        .collect();
                    println!("{}", to_json(&keys));
                } else {
                    for provider in Provider::ALL {
                        println!(
                            "  {:<10} {}  ({})",
                            provider.as_str(),
                            key_status(provider),
                            provider.env_var().dimmed()
                        );
                    }
                    if Provider::ALL.iter().any(|p| !has_api_key(*p)) {
                        println!("\nSet with: openresearch config api-key set <PROVIDER> <KEY>");
                    }
                }
            }

            ApiKeyAction::Set { provider, key } => {
                validate_api_key(&key)?;
                write_api_key(provider, &key)?;

                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "status": "success", "provider": provider.as_str() })
                    );
                } else {
                    println!("{} {} API key saved", "✓".green(), provider.as_str());
                }
            }

            ApiKeyAction::Clear { provider } => {
                delete_api_key(provider)?;

                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "status": "cleared", "provider": provider.as_str() })
                    );
                } else {
                    println!("{} {} API key cleared", "✓".green(), provider.as_str());
                }
            }
        },
    }

    Ok(())
}

fn key_status(provider: Provider) -> String {
    if has_api_key(provider) {
        "✓ set".green().to_string()
    } else {
        "✗ not set".red().to_string()
    }
}
