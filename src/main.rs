use warehouse_sql_agent::config::AppConfig;
use warehouse_sql_agent::guard::StatementGuard;
use warehouse_sql_agent::tool::WarehouseTool;
use warehouse_sql_agent::SqlAgent;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sql-agent")]
#[command(about = "Natural-language questions answered with guarded, self-repairing warehouse SQL")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a natural-language question against a domain's warehouse
    Query {
        /// The question in natural language
        text: String,

        /// Domain key (org, person, ...)
        #[arg(short, long, default_value = "org")]
        domain: String,

        /// Path to the configuration file
        #[arg(short, long, default_value = "config/config.toml")]
        config: PathBuf,

        /// Print every attempt alongside the result
        #[arg(long)]
        trail: bool,
    },
    /// Run only the statement guard on a SQL string
    Check {
        sql: String,
    },
    /// Print the function-calling schema of the warehouse tool
    ToolSchema {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config/config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Query {
            text,
            domain,
            config,
            trail,
        } => run_query(text, domain, config, trail).await,
        Commands::Check { sql } => run_check(sql),
        Commands::ToolSchema { config } => print_tool_schema(config),
    }
}

async fn run_query(text: String, domain: String, config_path: PathBuf, trail: bool) -> Result<()> {
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let mut agent = SqlAgent::from_config(&config, &domain)?;
    info!("Using {} ({})", agent.name(), agent.description());

    let outcome = agent.process_with_trail(&text).await;
    if let Err(e) = agent.close().await {
        warn!("Failed to close warehouse connection: {}", e);
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let output = if trail {
        serde_json::to_value(&outcome)?
    } else {
        serde_json::json!({
            "columns": outcome.result.columns,
            "records": outcome.result.to_records(),
        })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_check(sql: String) -> Result<()> {
    let verdict = StatementGuard::new().check(&sql);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn print_tool_schema(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let tool = WarehouseTool::from_config(Arc::new(config));
    println!("{}", serde_json::to_string_pretty(&tool.to_param())?);
    Ok(())
}
