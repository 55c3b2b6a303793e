//! deskmated - IT support diagnostic daemon
//!
//! `serve` speaks JSON-RPC over stdio; the other subcommands run a single
//! pipeline operation and print the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deskmate_shared::{Category, ChatRequest, DeviceInfo, TechnicalLevel};
use deskmated::{safety, server, Config, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Deskmate diagnostic daemon
#[derive(Parser)]
#[command(name = "deskmated")]
#[command(about = "Deskmate - IT support diagnostic pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (overrides $DESKMATE_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results and logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-RPC requests on stdin/stdout
    Serve,

    /// Diagnose a problem in one turn
    Ask {
        /// Problem description
        #[arg(required = true)]
        message: Vec<String>,

        /// Session id to continue
        #[arg(long)]
        session: Option<String>,

        /// Device type, e.g. laptop
        #[arg(long)]
        device: Option<String>,

        /// Operating system, e.g. "Windows 11"
        #[arg(long)]
        os: Option<String>,

        /// beginner, intermediate or advanced
        #[arg(long, default_value = "beginner")]
        level: String,
    },

    /// Assess a problem without producing steps
    Analyze {
        #[arg(required = true)]
        problem: Vec<String>,
    },

    /// Search the knowledge base
    Search {
        #[arg(required = true)]
        query: Vec<String>,

        #[arg(long)]
        category: Option<Category>,

        #[arg(long, default_value_t = 5)]
        limit: usize,
    },

    /// Assess the risk of a command before running it
    CheckCommand {
        #[arg(required = true)]
        command: Vec<String>,
    },

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // an unreadable $DESKMATE_CONFIG is reported once logging is up
    let (config, load_error) = match &cli.config {
        Some(path) => (Config::load_from_path(path)?, None),
        None => match Config::try_load() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };
    init_logging(&config, cli.json);
    if let Some(e) = load_error {
        warn!("Config not loaded, using defaults: {:#}", e);
    }

    match cli.command {
        Commands::Config => print!("{}", Config::default_toml()?),
        Commands::CheckCommand { command } => {
            let assessment = safety::assess_command(&command.join(" "));
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&assessment)?);
            } else {
                println!("risk: {}", assessment.risk.as_str());
                println!("requires confirmation: {}", assessment.requires_confirmation);
                if assessment.blocked {
                    println!("blocked: yes");
                }
                for warning in &assessment.warnings {
                    println!("  {}", warning);
                }
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(build(&config).await?);
            server::serve_stdio(pipeline).await?;
            info!("Shutting down");
        }
        Commands::Ask {
            message,
            session,
            device,
            os,
            level,
        } => {
            let pipeline = build(&config).await?;
            let mut request = ChatRequest::new(message.join(" "));
            request.session_id = session;
            request.technical_level = parse_level(&level)?;
            if device.is_some() || os.is_some() {
                request.device_info = Some(DeviceInfo {
                    device_type: device,
                    os,
                    ..Default::default()
                });
            }
            let diagnosis = pipeline.handle(request).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&diagnosis)?);
            } else {
                println!("{}", diagnosis.response);
                println!();
                println!("session: {}  route: {}", diagnosis.session_id, diagnosis.reasoning_route);
            }
        }
        Commands::Analyze { problem } => {
            let pipeline = build(&config).await?;
            let analysis = pipeline.analyze(&problem.join(" "), None).await?;
            // always JSON; there is no prose rendering for an analysis
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
        Commands::Search {
            query,
            category,
            limit,
        } => {
            let pipeline = build(&config).await?;
            let results = pipeline.search(&query.join(" "), limit, category, None).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No matching articles.");
            } else {
                for passage in &results {
                    println!(
                        "{:.2}  [{}] {}",
                        passage.similarity,
                        passage.metadata.category,
                        passage.display_title()
                    );
                }
            }
        }
    }

    Ok(())
}

async fn build(config: &Config) -> Result<Pipeline> {
    Pipeline::from_config(config)
        .await
        .context("Failed to initialize pipeline")
}

fn parse_level(level: &str) -> Result<TechnicalLevel> {
    match level.trim().to_lowercase().as_str() {
        "beginner" => Ok(TechnicalLevel::Beginner),
        "intermediate" => Ok(TechnicalLevel::Intermediate),
        "advanced" => Ok(TechnicalLevel::Advanced),
        other => anyhow::bail!("unknown technical level '{}'", other),
    }
}

/// Logs go to stderr; stdout carries responses.
fn init_logging(config: &Config, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if json || config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}
