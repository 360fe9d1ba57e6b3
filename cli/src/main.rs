//! sbtindex CLI: runs the SBT indexer and queries the indexed scores.
//!
//! # Commands
//! ```text
//! sbtindex run         --config <file.json>
//! sbtindex score       --config <file.json> <token-id>
//! sbtindex collection  --config <file.json> <owner>
//! sbtindex leaderboard --config <file.json> [--limit N]
//! sbtindex info
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use sbtindex_core::cache::{RankCache, RankTable};
use sbtindex_core::checkpoint::CheckpointStore;
use sbtindex_core::score;
use sbtindex_core::store::TokenStore;
use sbtindex_core::types::TokenKey;
use sbtindex_evm::{policy_configs, IndexerBuilder, RpcContractReader};
use sbtindex_rpc::{HttpRpcClient, RateLimitedTransport};
use sbtindex_storage::SqliteStorage;

mod config;
mod logging;

use config::AppConfig;

type Reader = RpcContractReader<RateLimitedTransport<HttpRpcClient>>;

#[derive(Parser)]
#[command(
    name = "sbtindex",
    about = "SBT ownership and score indexer",
    long_about = "
sbtindex: follows Reveal, Transfer and Collected events of an SBT contract,
keeps token ownership in SQLite and computes live time-accrued scores.

ENVIRONMENT VARIABLES:
  SBTINDEX_RPC_URL     JSON-RPC endpoint (overrides rpc_url)
  SBTINDEX_DATABASE    SQLite file (overrides database)
  RUST_LOG             tracing filter (overrides log.level)
",
    version
)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Catch up from the last checkpoint, then follow the chain head
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the live score of one token
    Score {
        #[arg(short, long)]
        config: PathBuf,
        /// Decimal token id
        token_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the tokens held by an address, highest score first
    Collection {
        #[arg(short, long)]
        config: PathBuf,
        owner: String,
        #[arg(long)]
        json: bool,
    },

    /// Rank owners by live plus collected score
    Leaderboard {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Show version and defaults
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => cmd_run(&config, cli.verbose).await,
        Commands::Score {
            config,
            token_id,
            json,
        } => cmd_score(&config, cli.verbose, &token_id, json).await,
        Commands::Collection {
            config,
            owner,
            json,
        } => cmd_collection(&config, cli.verbose, &owner, json).await,
        Commands::Leaderboard {
            config,
            limit,
            json,
        } => cmd_leaderboard(&config, cli.verbose, limit, json).await,
        Commands::Info => cmd_info(),
    }
}

// ─── Setup ────────────────────────────────────────────────────────────────────

fn load_config(path: &Path, verbose: bool) -> Result<AppConfig> {
    let mut config = AppConfig::load(path)?;
    if verbose {
        config.log.level = "debug".into();
    }
    logging::init_tracing(&config.log);
    Ok(config)
}

fn build_reader(config: &AppConfig) -> Result<Reader> {
    let client = HttpRpcClient::new(
        config.rpc_url.as_str(),
        Duration::from_secs(config.request_timeout_secs),
    )
    .context("create RPC client")?;
    let (limiter, retry) = policy_configs(&config.indexer.rate_limit);
    let transport = RateLimitedTransport::new(client, limiter, retry);
    RpcContractReader::new(
        transport,
        config.indexer.contract_address.as_str(),
        &config.indexer.events,
    )
    .context("create contract reader")
}

async fn open_store(config: &AppConfig) -> Result<SqliteStorage> {
    SqliteStorage::open(&config.database)
        .await
        .with_context(|| format!("open database '{}'", config.database))
}

/// Load the rank constants needed for scoring.
async fn load_ranks(reader: &Reader, config: &AppConfig) -> Result<RankTable> {
    let cache = RankCache::new();
    let report = cache.initialize(reader, &config.indexer.rank_ids).await;
    if !report.is_ready() {
        return Err(anyhow!(
            "no rank constants could be loaded ({} failed, {} absent)",
            report.failed.len(),
            report.absent.len()
        ));
    }
    Ok(cache.snapshot())
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_run(path: &Path, verbose: bool) -> Result<()> {
    let config = load_config(path, verbose)?;
    let reader = Arc::new(build_reader(&config)?);
    let store = Arc::new(open_store(&config).await?);
    let checkpoints: Arc<dyn CheckpointStore> = store.clone();

    let indexer = IndexerBuilder::from_config(config.indexer.clone())
        .checkpoint_store(checkpoints)
        .build(reader, store)
        .context("build indexer")?;

    tracing::info!(
        chain = %config.indexer.chain,
        contract = %config.indexer.contract_address,
        start_block = config.indexer.start_block,
        database = %config.database,
        "starting sbtindex"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };

    Arc::new(indexer).run(shutdown).await?;
    Ok(())
}

async fn cmd_score(path: &Path, verbose: bool, token_id: &str, json: bool) -> Result<()> {
    let config = load_config(path, verbose)?;
    let reader = build_reader(&config)?;
    let store = open_store(&config).await?;

    let key = TokenKey::new(config.indexer.contract_key(), token_id);
    let token = store
        .get_token(&key)
        .await?
        .ok_or_else(|| anyhow!("token {token_id} is not indexed"))?;
    let ranks = load_ranks(&reader, &config).await?;
    let now = Utc::now().timestamp();
    let live = score::score(&token, now, &ranks);
    let expired = score::is_expired(&token, now, &ranks);

    if json {
        let out = serde_json::json!({
            "token": token,
            "score": live,
            "expired": expired,
            "expiration": score::expiration(&token, &ranks),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Token:      {}", token.token_id);
        println!("Owner:      {}", token.owner_address);
        println!("Rank:       {}", token.rank);
        println!("Minted:     {}", token.mint_timestamp);
        match score::expiration(&token, &ranks) {
            Some(exp) => println!("Expires:    {exp}{}", if expired { " (expired)" } else { "" }),
            None => println!("Expires:    unknown rank"),
        }
        println!("Score:      {live:.4}");
        println!("Collected:  {}", token.last_collected_score);
    }
    Ok(())
}

async fn cmd_collection(path: &Path, verbose: bool, owner: &str, json: bool) -> Result<()> {
    let config = load_config(path, verbose)?;
    let reader = build_reader(&config)?;
    let store = open_store(&config).await?;

    let tokens = store
        .tokens_by_owner(&config.indexer.contract_key(), owner)
        .await?;
    let ranks = load_ranks(&reader, &config).await?;
    let scored = score::rank_tokens(&tokens, Utc::now().timestamp(), &ranks);

    if json {
        println!("{}", serde_json::to_string_pretty(&scored)?);
    } else if scored.is_empty() {
        println!("{owner} holds no indexed tokens");
    } else {
        println!("{:<12} {:>4} {:>16}  expired", "token", "rank", "score");
        for t in &scored {
            println!("{:<12} {:>4} {:>16.4}  {}", t.token_id, t.rank, t.score, t.expired);
        }
    }
    Ok(())
}

async fn cmd_leaderboard(path: &Path, verbose: bool, limit: usize, json: bool) -> Result<()> {
    let config = load_config(path, verbose)?;
    let reader = build_reader(&config)?;
    let store = open_store(&config).await?;

    let tokens = store.tokens(&config.indexer.contract_key()).await?;
    let ranks = load_ranks(&reader, &config).await?;
    let board = score::leaderboard(&tokens, Utc::now().timestamp(), &ranks, limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&board)?);
    } else {
        println!("{:>4}  {:<42} {:>6} {:>16}", "#", "owner", "tokens", "total");
        for (i, row) in board.iter().enumerate() {
            println!(
                "{:>4}  {:<42} {:>6} {:>16.4}",
                i + 1,
                row.owner_address,
                row.tokens,
                row.total()
            );
        }
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = IndexerBuilder::new().build_config();
    println!("sbtindex v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Events:");
    println!("  {}", defaults.events.reveal);
    println!("  {}", defaults.events.transfer);
    println!("  {}", defaults.events.collect);
    println!("Rank constants:  {}", defaults.events.rank_constants);
    println!();
    println!("Defaults:");
    println!("  batch_size        {} blocks", defaults.batch_size);
    println!("  poll_interval     {} ms", defaults.poll_interval_ms);
    println!("  rank_ids          {:?}", defaults.rank_ids);
    println!(
        "  rate limit        {} req / {} ms, {} attempts",
        defaults.rate_limit.reservoir,
        defaults.rate_limit.refill_interval_ms,
        defaults.rate_limit.max_attempts
    );
    println!("Storage:           SQLite (sqlx)");
    Ok(())
}
