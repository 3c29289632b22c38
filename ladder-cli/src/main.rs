use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ladder_broker::ExchangeClient;
use ladder_config::{load_config, AppConfig};
use ladder_core::{EntrySignal, SnapshotCache};
use ladder_engine::{Engine, EngineResult, PositionSummary};
use ladder_ledger::{CachedStore, PositionStore, SqliteStore};
use ladder_paper::{PaperExchange, SnapshotFeed};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ladder", about = "Scaled-entry spot position engine", version)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration environment (loads config/<env>.toml on top of defaults).
    #[arg(long, global = true)]
    env: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against the in-process paper exchange.
    PaperRun {
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// Number of synthetic market ticks to play.
        #[arg(long, default_value_t = 240)]
        ticks: u32,
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
        /// Seed for the synthetic feed; omit for a random walk.
        #[arg(long)]
        seed: Option<u64>,
        /// Paper account balance in quote units.
        #[arg(long, default_value_t = 100_000)]
        balance: u64,
    },
    /// Print open positions from the ledger as JSON.
    Positions,
}

fn init_telemetry(cfg: &AppConfig, verbose: u8) {
    let level = match verbose {
        0 => cfg.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.env.as_deref()).context("failed to load configuration")?;
    init_telemetry(&cfg, cli.verbose);

    match cli.command {
        Command::PaperRun {
            symbol,
            ticks,
            interval_ms,
            seed,
            balance,
        } => paper_run(&cfg, symbol, ticks, interval_ms, seed, balance).await,
        Command::Positions => positions(&cfg),
    }
}

fn open_store(cfg: &AppConfig) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = cfg.persistence.path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::new(&cfg.persistence.path)
        .with_context(|| format!("failed to open ledger at {}", cfg.persistence.path.display()))?;
    Ok(Arc::new(store))
}

async fn paper_run(
    cfg: &AppConfig,
    symbol: String,
    ticks: u32,
    interval_ms: u64,
    seed: Option<u64>,
    balance: u64,
) -> Result<()> {
    let sqlite = open_store(cfg)?;
    let store: Arc<dyn PositionStore> = Arc::new(CachedStore::new(sqlite));
    let snapshots = Arc::new(SnapshotCache::new());
    let exchange = Arc::new(PaperExchange::new(
        Decimal::from(balance),
        Decimal::new(1, 3),
    ));
    let client: Arc<dyn ExchangeClient> = exchange.clone();
    let engine = Arc::new(Engine::new(cfg, client, store, snapshots.clone()));

    let start_price = Decimal::from(100);
    let atr = Decimal::new(15, 1);
    let mut feed = match seed {
        Some(seed) => SnapshotFeed::with_seed(symbol.clone(), start_price, atr, seed),
        None => SnapshotFeed::new(symbol.clone(), start_price, atr),
    };
    info!(%symbol, ticks, "paper run starting");

    for tick in 0..ticks {
        snapshots.update(feed.next());

        // A single conviction signal early in the run opens the position;
        // later ticks exercise phased adds and the exit chain.
        if tick == 3 || tick % 60 == 0 {
            let signal = EntrySignal::new("paper", symbol.clone(), Decimal::new(9, 1));
            match engine.process_entry_signal(&signal).await {
                EngineResult::Completed(Some(summary)) => {
                    info!(
                        phase = summary.entry_phase,
                        avg = %summary.avg_entry_price,
                        quantity = %summary.quantity,
                        "entry accepted"
                    );
                }
                EngineResult::Completed(None) => {}
                EngineResult::Rejected { code, message } => {
                    info!(%code, detail = %message, "entry rejected");
                }
                EngineResult::Error { message } => {
                    warn!(detail = %message, "entry failed");
                }
            }
        }

        engine.monitor_tick().await;
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }

    engine.stop();
    let summaries = engine.open_position_summaries();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    info!(
        open = summaries.len(),
        placed = exchange.place_calls(),
        "paper run finished"
    );
    Ok(())
}

fn positions(cfg: &AppConfig) -> Result<()> {
    let store = open_store(cfg)?;
    let open = store
        .open_positions()
        .context("failed to list open positions")?;
    let summaries: Vec<PositionSummary> = open
        .iter()
        .map(|position| PositionSummary::of(position, None))
        .collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
