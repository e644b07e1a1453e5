//! # Ledger Terminal
//!
//! Command-line access to the ledger client and its cache.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin ledger_terminal -- account rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh
//! cargo run --bin ledger_terminal -- --network xahau nfts rXXXX
//! cargo run --bin ledger_terminal -- offers 000800006203F49C21D5D6E022CB16DE3538F248662FC73C00000000
//! cargo run --bin ledger_terminal -- wait <TX_HASH> --max-wait-ms 30000
//! ```
//!
//! Results are printed as pretty JSON. Set `LEDGER_CACHE_DATABASE_URL` (or `cache.database_url`
//! in `Config.toml`) to serve the read commands through the SQLite cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use xrpl_ledger_gateway::{
    ledger_cache::CacheTtls, CacheStore, CachedFetcher, DetachedScheduler, Fetched, LedgerCache,
    LedgerClient, Network, Settings, WsConnector,
};

#[derive(Parser, Debug)]
#[command(name = "ledger_terminal", about = "Query XRPL / Xahau nodes")]
struct Cli {
    /// Network to query (defaults to `network.default` from the config)
    #[arg(long, global = true)]
    network: Option<Network>,

    /// Config file (defaults to ./Config.toml when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Bypass the cache even when one is configured
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Account root: balance, sequence, owner count
    Account { address: String },
    /// Every NFT owned by an account
    Nfts { address: String },
    /// Sell and buy offers for an NFT
    Offers { nft_id: String },
    /// Transaction lookup
    Tx { hash: String },
    /// Poll until a transaction is validated
    Wait {
        hash: String,
        #[arg(long)]
        max_wait_ms: Option<u64>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Node status
    ServerInfo,
}

#[derive(Serialize)]
struct CachedOutput<'a, T: Serialize> {
    from_cache: bool,
    is_stale: bool,
    data: &'a T,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_fetched<T: Serialize>(fetched: &Fetched<T>) -> Result<()> {
    print_json(&CachedOutput {
        from_cache: fetched.from_cache,
        is_stale: fetched.is_stale,
        data: &fetched.data,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path, true)
            .with_context(|| format!("loading config from {}", path))?,
        None => Settings::new().context("loading Config.toml")?,
    };
    if let Some(network) = cli.network {
        settings.network.default = network;
    }

    let connector = Arc::new(WsConnector::new(settings.network.request_timeout()));
    let client = LedgerClient::from_settings(connector, &settings);

    let store = match (&settings.cache.database_url, cli.no_cache) {
        (Some(url), false) => match CacheStore::sqlite(url).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("⚠️ [LedgerTerminal] Cache unavailable, querying directly: {}", e);
                None
            }
        },
        _ => None,
    };
    let scheduler = Arc::new(DetachedScheduler::new());
    let cache = LedgerCache::new(
        client.clone(),
        CachedFetcher::new(store, scheduler.clone()),
        CacheTtls::from_settings(&settings),
    );

    info!(
        "🚀 [LedgerTerminal] Using {} (cache {})",
        settings.network.default,
        if cache.fetcher().store().is_some() { "on" } else { "off" }
    );

    let outcome = run(&cli.command, &client, &cache).await;

    // Let refreshes of stale entries land before the process goes away.
    scheduler.flush().await;
    client.disconnect().await;
    outcome
}

async fn run(command: &Commands, client: &LedgerClient, cache: &LedgerCache) -> Result<()> {
    match command {
        Commands::Account { address } => print_fetched(&cache.account_info(address).await?),
        Commands::Nfts { address } => print_fetched(&cache.account_nfts(address).await?),
        Commands::Offers { nft_id } => print_fetched(&cache.nft_offers(nft_id).await?),
        Commands::Tx { hash } => print_json(&client.transaction(hash).await?),
        Commands::Wait {
            hash,
            max_wait_ms,
            poll_interval_ms,
        } => {
            let options = client.options();
            let max_wait = max_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(options.validation_max_wait);
            let poll = poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(options.validation_poll_interval);
            let tx = client.wait_for_validation_with(hash, max_wait, poll).await?;
            print_json(&tx)
        }
        Commands::ServerInfo => print_json(&client.server_info().await?),
    }
}
