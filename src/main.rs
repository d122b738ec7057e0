use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use room_sniper::api::{HttpReputationEvaluator, RoomsClient, SocialClient};
use room_sniper::chain::{EvmSharesClient, SharesChain};
use room_sniper::config::{Config, StorageBackend};
use room_sniper::notify::Notifier;
use room_sniper::sniper::Sniper;
use room_sniper::storage::{FileStore, SqliteStore, Store};

#[derive(Parser)]
#[command(name = "room-sniper", about = "Reputation-gated sniper for room shares")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the contract and trade (default).
    Run,
    /// Print candidate counts, current holdings and the block checkpoint.
    Status,
    /// Administratively ignore a candidate, or remove it with --delete.
    Evict {
        address: String,
        #[arg(long)]
        delete: bool,
    },
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    Ok(match config.storage {
        StorageBackend::File => Arc::new(
            FileStore::open(&config.data_dir)
                .await
                .context("Failed to open file store")?,
        ),
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::connect(&config.database_path)
                .await
                .context("Failed to connect SQLite store")?,
        ),
    })
}

async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let store = open_store(&config).await?;

    let chain = Arc::new(
        EvmSharesClient::connect(&config)
            .await
            .context("Failed to connect chain client")?,
    );
    info!("Chain client connected, wallet {:?}", chain.wallet_address());

    let evaluator = Arc::new(HttpReputationEvaluator::new(
        RoomsClient::new(&config.rooms_api_url),
        SocialClient::new(&config.social_api_url, config.social_api_key.clone()),
    ));
    let notifier = config
        .webhook_url
        .as_deref()
        .map(|url| Arc::new(Notifier::new(url)));

    let sniper = Sniper::new(chain, store, evaluator, notifier, config);
    sniper.clone().start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Interrupt received");
    sniper.shutdown().await;
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let store = open_store(&config).await?;

    println!("Candidates:");
    let counts = store.candidate_counts().await?;
    if counts.is_empty() {
        println!("  (none)");
    }
    for (status, count) in counts {
        println!("  {:<8} {}", status, count);
    }

    println!("Holdings:");
    let positions = store.positions().await?;
    if positions.is_empty() {
        println!("  (none)");
    }
    for position in positions {
        println!(
            "  {} x{} ({} purchase(s))",
            position.address_checksum,
            position.total_amount,
            position.purchases.len()
        );
    }

    match store.last_processed_block().await? {
        Some(block) => println!("Last processed block: {}", block),
        None => println!("Last processed block: (no checkpoint)"),
    }
    Ok(())
}

async fn evict(config: Config, address: String, delete: bool) -> Result<()> {
    let store = open_store(&config).await?;
    let key = address.to_lowercase();

    if store.candidate(&key).await?.is_none() {
        anyhow::bail!("no candidate tracked at {}", key);
    }

    if delete {
        store.delete_candidate(&key).await?;
        println!("Deleted candidate {}", key);
    } else {
        store
            .mark_ignored(&key, "evicted by operator", Utc::now())
            .await?;
        println!("Marked candidate {} ignored", key);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenv().ok();
    let config = Config::load()?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => status(config).await,
        Command::Evict { address, delete } => evict(config, address, delete).await,
    }
}
