//! tollgate - local OpenAI-compatible LLM gateway
//!
//! Forwards chat completions to configured providers, prices every call,
//! and logs each one to SQLite for the analytics endpoints.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate::catalog::PricingTable;
use tollgate::config::Config;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "Local OpenAI-compatible LLM gateway with cost accounting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show configured models, their providers and prices
    Models {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &Path {
        match self {
            Commands::Serve { config, .. }
            | Commands::Check { config }
            | Commands::Models { config } => config,
        }
    }
}

/// `logging.level` from the config file, read before full parsing so that
/// validation warnings already go through the subscriber.
fn peek_log_level(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let document: toml::Table = toml::from_str(&content).ok()?;
    document
        .get("logging")?
        .get("level")?
        .as_str()
        .map(str::to_string)
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tollgate={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = peek_log_level(cli.command.config_path()).unwrap_or_else(|| "info".to_string());
    init_tracing(&level);

    match cli.command {
        Commands::Serve { config, listen } => {
            tracing::info!(config = %config.display(), "Loading configuration");
            let (mut cfg, key_sources) = Config::from_file_with_env(&config)
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;

            for (provider, source) in &key_sources {
                tracing::debug!(provider = %provider, key_source = %source, "Resolved API key");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            tollgate::proxy::run_server(cfg, config).await
        }

        Commands::Check { config } => {
            let (cfg, key_sources) = Config::from_file_with_env(&config)
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;

            println!("Configuration OK: {}", config.display());
            println!("  listen:    {}", cfg.server.listen);
            println!("  database:  {}", cfg.database().path);
            println!(
                "  auth:      {}",
                if cfg.server.auth_token.is_some() {
                    "bearer token required"
                } else {
                    "open"
                }
            );
            println!("  models:    {}", cfg.models.len());
            println!("  providers:");
            for (provider, source) in &key_sources {
                println!("    {:<20} key: {}", provider, source);
            }
            Ok(())
        }

        Commands::Models { config } => {
            let (cfg, _) = Config::from_file_with_env(&config)
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;
            let pricing = PricingTable::from_config(&cfg);

            println!(
                "{:<28} {:<16} {:>12} {:>12} {:>10}",
                "MODEL", "PROVIDER", "PROMPT/1M", "COMPL/1M", "CONTEXT"
            );
            for model in &cfg.models {
                let (prompt, completion) = match pricing.get(&model.name) {
                    Some(entry) => (
                        format!("${:.4}", entry.prompt_per_million()),
                        format!("${:.4}", entry.completion_per_million()),
                    ),
                    None => ("-".to_string(), "-".to_string()),
                };
                let context = model
                    .context_length
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<28} {:<16} {:>12} {:>12} {:>10}",
                    model.name, model.provider, prompt, completion, context
                );
                for fallback in &model.fallbacks {
                    println!("{:<28} {:<16} (fallback)", "", fallback.provider);
                }
            }
            Ok(())
        }
    }
}
