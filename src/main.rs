//! `idlookup` operator CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use idlookup::lookup::{hash_address, Algorithm, Medium};
use idlookup::{Config, Engine};

/// Token issuance and privacy-preserving lookup engine.
#[derive(Parser, Debug)]
#[command(name = "idlookup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.idlookup/config.toml)
    #[arg(short, long, env = "IDLOOKUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reaper and pepper rotation until interrupted
    Run,

    /// Issue, check or revoke tokens
    #[command(subcommand)]
    Token(TokenCommand),

    /// Hash one address the way lookup clients do
    Hash {
        address: String,
        #[arg(short, long, default_value = "email")]
        medium: String,
        #[arg(short, long, default_value = "sha256")]
        algorithm: String,
        /// Pepper to hash with (defaults to the current one)
        #[arg(short, long)]
        pepper: Option<String>,
    },

    /// Print the advertised algorithms and current pepper
    HashDetails,

    /// Resolve hashes to identifiers
    Lookup {
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Rebuild the hash index from the configured directory
    Index,
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    /// Create a token carrying a JSON payload
    Create {
        /// JSON payload
        payload: String,
        /// Single-use token
        #[arg(long)]
        one_time: bool,
        /// Lifetime in seconds (defaults from config)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print a token's payload
    Verify {
        id: String,
        /// Consume a single-use token
        #[arg(long)]
        one_time: bool,
    },
    /// Delete a durable token
    Revoke { id: String },
}

fn setup_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.filter))
        .context("Invalid log filter")?;
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set subscriber: {e}"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    setup_logging(&config)?;

    let mut engine = Engine::open(&config).await?;

    match cli.command {
        Command::Run => {
            if let Err(e) = engine.refresh_index().await {
                tracing::debug!(error = %e, "Initial index refresh skipped");
            }
            engine.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
        }
        Command::Token(cmd) => run_token(&engine, cmd).await?,
        Command::Hash {
            address,
            medium,
            algorithm,
            pepper,
        } => {
            let algorithm: Algorithm = algorithm.parse()?;
            let medium: Medium = medium.parse()?;
            let pepper = pepper.unwrap_or_else(|| engine.current_salt());
            println!("{}", hash_address(algorithm, &address, medium, &pepper));
        }
        Command::HashDetails => print_json(&engine.hash_details())?,
        Command::Lookup { hashes } => {
            let mappings = engine.resolve(&hashes).await?;
            print_json(&serde_json::json!({ "mappings": mappings }))?;
        }
        Command::Index => {
            let stats = engine.refresh_index().await?;
            println!("indexed {} rows, removed {}", stats.indexed, stats.removed);
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn run_token(engine: &Engine, cmd: TokenCommand) -> Result<()> {
    let tokens = engine.tokens();
    match cmd {
        TokenCommand::Create {
            payload,
            one_time,
            ttl,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let ttl = ttl.map(Duration::from_secs);
            let id = if one_time {
                tokens.create_one_time_token(&payload, ttl).await?
            } else {
                tokens.create_token(&payload, ttl).await?
            };
            println!("{id}");
        }
        TokenCommand::Verify { id, one_time } => {
            let payload: serde_json::Value = if one_time {
                tokens.verify_one_time_token(&id).await?
            } else {
                tokens.verify_token(&id).await?
            };
            print_json(&payload)?;
        }
        TokenCommand::Revoke { id } => {
            if tokens.revoke_token(&id).await? {
                println!("revoked");
            } else {
                println!("not found");
            }
        }
    }
    Ok(())
}
