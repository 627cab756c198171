//! PixelWatch CLI
//!
//! CLI tool for classifying requests, replaying captured traffic through the
//! pipeline and checking provider catalogs.

mod perf_budget;
mod replay;

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use pw_core::{normalize, Matcher, Provider, ProviderRegistry, RawBody, RawRequest};
use pw_pipeline::PipelineConfig;
use pw_providers::{build_registry, builtin_registry, parse_provider_docs};

#[derive(Parser)]
#[command(name = "pw-cli")]
#[command(about = "PixelWatch tracking request detector and tools")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single request and print every candidate
    Classify {
        /// Request URL
        url: String,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request body as text
        #[arg(short, long)]
        body: Option<String>,

        /// Provider definition file (JSON); the builtin catalog is used otherwise
        #[arg(short, long)]
        providers: Option<String>,

        /// Minimum confidence for a candidate
        #[arg(long)]
        min_confidence: Option<f64>,
    },

    /// Replay a JSON Lines capture of host callbacks through the pipeline
    Replay {
        /// Capture file, one callback per line
        #[arg(short, long)]
        input: String,

        /// Provider definition file (JSON)
        #[arg(short, long)]
        providers: Option<String>,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<String>,

        /// Print pipeline stats when done
        #[arg(long)]
        stats: bool,
    },

    /// List the providers in a catalog
    Providers {
        /// Provider definition file (JSON)
        #[arg(short, long)]
        providers: Option<String>,
    },

    /// Validate a pipeline configuration file and print the effective settings
    CheckConfig {
        /// Configuration file (JSON)
        #[arg(short, long)]
        input: String,
    },

    /// Check classification latency against the budget
    PerfBudget {
        /// Provider definition file (JSON)
        #[arg(short, long)]
        providers: Option<String>,

        /// Passes over the sample requests
        #[arg(long, default_value_t = 2000)]
        iterations: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let result = match cli.command {
        Commands::Classify {
            url,
            method,
            body,
            providers,
            min_confidence,
        } => cmd_classify(&url, &method, body, providers.as_deref(), min_confidence),
        Commands::Replay {
            input,
            providers,
            config,
            stats,
        } => load_registry(providers.as_deref())
            .and_then(|registry| replay::run_replay(&input, registry, config.as_deref(), stats)),
        Commands::Providers { providers } => cmd_providers(providers.as_deref()),
        Commands::CheckConfig { input } => cmd_check_config(&input),
        Commands::PerfBudget {
            providers,
            iterations,
        } => load_registry(providers.as_deref())
            .and_then(|registry| perf_budget::run_perf_budget(registry, iterations)),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Load providers from a definition file, or the builtin catalog.
pub(crate) fn load_registry(path: Option<&str>) -> Result<Arc<ProviderRegistry>, String> {
    let registry = match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read '{}': {}", path, e))?;
            let docs = parse_provider_docs(&content)
                .map_err(|e| format!("Invalid provider definitions in '{}': {}", path, e))?;
            build_registry(docs).map_err(|e| format!("Failed to compile '{}': {}", path, e))?
        }
        None => builtin_registry().map_err(|e| format!("Builtin catalog is invalid: {}", e))?,
    };
    Ok(Arc::new(registry))
}

fn cmd_classify(
    url: &str,
    method: &str,
    body: Option<String>,
    providers: Option<&str>,
    min_confidence: Option<f64>,
) -> Result<(), String> {
    let registry = load_registry(providers)?;
    let mut matcher = Matcher::new(registry);
    if let Some(min) = min_confidence {
        matcher = matcher.with_min_confidence(min);
    }

    let raw = RawRequest {
        method: method.to_string(),
        body: body.map(RawBody::Text),
        ..RawRequest::get("cli", url, -1)
    };
    let record = normalize(&raw).map_err(|e| format!("Cannot classify '{}': {}", url, e))?;

    let start = Instant::now();
    let outcome = matcher.classify(&record);
    let elapsed = start.elapsed();

    println!("{} {}", record.method, record.url);
    println!("  Fingerprint: {}", record.fingerprint);
    println!("  Time:        {:.1}μs", elapsed.as_secs_f64() * 1_000_000.0);
    println!();

    if outcome.candidates.is_empty() {
        println!("No provider matched (minimum confidence {:.2})", matcher.min_confidence());
    } else {
        println!("Candidates:");
        for candidate in &outcome.candidates {
            println!(
                "  {:<20} {:.2}  [{}]",
                candidate.provider_id,
                candidate.confidence,
                candidate.matched_rules.join(", ")
            );
        }
    }
    for fault in &outcome.faults {
        println!("  ! {}", fault);
    }

    if let Some(promoted) = &outcome.promoted {
        println!();
        println!("Promoted: {} ({})", promoted.provider_name, promoted.category);
        println!("  Event:       {}", promoted.event_type.as_deref().unwrap_or("unknown"));
        println!("  Account:     {}", promoted.account_id.as_deref().unwrap_or("-"));
        let params = serde_json::to_string_pretty(&promoted.parameters)
            .map_err(|e| format!("Failed to encode parameters: {}", e))?;
        println!("  Parameters:  {}", params);
        for issue in &promoted.validation_issues {
            println!("  ! {}", issue);
        }
    }

    Ok(())
}

fn cmd_providers(providers: Option<&str>) -> Result<(), String> {
    let registry = load_registry(providers)?;

    println!("{} providers", registry.len());
    for (order, provider) in registry.all().enumerate() {
        println!(
            "  [{:>2}] {:<20} {:<28} {}",
            order,
            provider.id(),
            provider.name(),
            provider.category()
        );
    }

    Ok(())
}

fn cmd_check_config(input: &str) -> Result<(), String> {
    let config = PipelineConfig::load_from_file(input)
        .map_err(|e| format!("Invalid configuration '{}': {}", input, e))?;
    let effective = serde_json::to_string_pretty(&config)
        .map_err(|e| format!("Failed to encode configuration: {}", e))?;

    println!("Configuration '{}' is valid", input);
    println!("{}", effective);

    Ok(())
}
