//! mevwatch - MEV relay data acquisition and reconciliation
//!
//! Commands:
//!   live         stream new heads and enrich every block (execution + relays)
//!   backfill     resume each relay's checkpoint and fill new and historical data
//!   detect-gaps  flag under-covered days per relay and write a gap list
//!   retry-gaps   re-walk every gap in a gap list, relays in parallel
//!
//! Environment:
//!   EXECUTION_RPC_URL  - execution JSON-RPC endpoint (live)
//!   EXECUTION_WS_URL   - execution WebSocket endpoint (live)
//!   BEACON_API_URL     - beacon API, bounds backfill at the finalized slot (optional)
//!   MEVWATCH_DB_PATH   - SQLite file (default: mevwatch.db)
//!   RELAYS_CONFIG_PATH - relay registry TOML (default: relays.toml if present, else built-in)

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use mevwatch_backend::backfill::{
    consolidate_gaps, detect_gaps, read_gap_file, relay_client_factory, retry, run_backfill,
    write_gap_file, GapDetectorConfig, GapFile, RetryOrchestrator,
};
use mevwatch_backend::clock::{Slot, SlotClock, SlotRange};
use mevwatch_backend::config::{
    db_path_from_env, Endpoints, LiveConfig, RelayRegistry, RetryPolicy, WalkerConfig,
};
use mevwatch_backend::live::{run_live, EnrichmentContext};
use mevwatch_backend::sources::{BeaconClient, ExecutionRpcClient, PayloadSource, RelayClient};
use mevwatch_backend::storage::{RecordStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "mevwatch")]
#[command(about = "MEV relay data acquisition and reconciliation")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "MEVWATCH_DB_PATH")]
    db: Option<String>,

    /// Relay registry TOML file
    #[arg(long)]
    relays_config: Option<String>,

    /// Only use these relays (comma-separated ids)
    #[arg(long, value_delimiter = ',')]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream new heads and enrich each block
    Live,

    /// Backfill every relay from its checkpoint
    Backfill {
        /// First UTC day to cover (YYYY-MM-DD)
        #[arg(long)]
        since: NaiveDate,

        /// Last UTC day to cover; defaults to the finalized slot
        #[arg(long)]
        until: Option<NaiveDate>,
    },

    /// Detect under-covered days per relay and write a gap list
    DetectGaps {
        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        #[arg(long, default_value = "gaps.json")]
        out: String,

        /// Fraction of a relay's mean below which a day is a gap
        #[arg(long, default_value = "0.5")]
        threshold_pct: f64,

        /// Merge gaps closer than this many slots
        #[arg(long, default_value_t = mevwatch_backend::backfill::DEFAULT_MERGE_THRESHOLD)]
        merge_threshold: Slot,
    },

    /// Re-walk every gap in a gap list
    RetryGaps {
        #[arg(long, default_value = "gaps.json")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let db_path = args.db.clone().unwrap_or_else(db_path_from_env);
    let registry = match &args.relays_config {
        Some(path) => RelayRegistry::load(path)
            .with_context(|| format!("Failed to load relay registry {}", path))?,
        None => RelayRegistry::from_env()?,
    }
    .filtered(&args.relays);

    if registry.relays.is_empty() {
        anyhow::bail!("No relays selected");
    }

    let clock = SlotClock::mainnet();

    match args.command {
        Commands::Live => cmd_live(&db_path, registry, clock).await,
        Commands::Backfill { since, until } => {
            cmd_backfill(&db_path, registry, clock, since, until).await
        }
        Commands::DetectGaps {
            from,
            to,
            out,
            threshold_pct,
            merge_threshold,
        } => cmd_detect_gaps(&db_path, clock, from, to, &out, threshold_pct, merge_threshold),
        Commands::RetryGaps { input } => cmd_retry_gaps(&db_path, registry, &input).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mevwatch=info,mevwatch_backend=info".into()),
        )
        .init();
}

fn load_env() {
    let _ = dotenv();
}

fn open_store(db_path: &str) -> Result<Arc<dyn RecordStore>> {
    Ok(Arc::new(SqliteStore::open(db_path)?))
}

async fn cmd_live(db_path: &str, registry: RelayRegistry, clock: SlotClock) -> Result<()> {
    // Fatal-Config checks happen before any connection is opened
    let endpoints = Endpoints::from_env();
    let rpc_url = endpoints.require_execution_rpc()?.to_string();
    let ws_url = endpoints.require_execution_ws()?.to_string();
    let live_config = LiveConfig::from_env()?;
    let policy = RetryPolicy::from_env()?;

    let store = open_store(db_path)?;
    let execution = Arc::new(ExecutionRpcClient::new(&rpc_url, policy)?);
    let mut relays: Vec<Arc<dyn PayloadSource>> = Vec::with_capacity(registry.relays.len());
    for info in &registry.relays {
        relays.push(Arc::new(RelayClient::new(info.clone(), policy)?));
    }

    info!(
        relays = relays.len(),
        initial_delay = ?live_config.relay_initial_delay,
        max_elapsed = ?live_config.relay_max_elapsed,
        "Starting live ingestion"
    );

    let ctx = Arc::new(EnrichmentContext {
        execution,
        relays,
        store,
        clock,
        config: live_config,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    run_live(&ws_url, ctx, shutdown_rx).await
}

/// Upper end of the backfill target: the finalized slot when a beacon API is
/// configured and answers, otherwise the wall-clock slot.
async fn current_bound(endpoints: &Endpoints, clock: &SlotClock) -> Slot {
    let Some(url) = endpoints.beacon_api_url.as_deref() else {
        return clock.current_slot();
    };
    let client = match BeaconClient::new(url, Duration::from_secs(10)) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Beacon client unavailable, using wall clock");
            return clock.current_slot();
        }
    };
    match client.finalized_slot().await {
        Ok(slot) => slot,
        Err(e) => {
            warn!(error = %e, "Finalized slot lookup failed, using wall clock");
            clock.current_slot()
        }
    }
}

async fn cmd_backfill(
    db_path: &str,
    registry: RelayRegistry,
    clock: SlotClock,
    since: NaiveDate,
    until: Option<NaiveDate>,
) -> Result<()> {
    let policy = RetryPolicy::from_env()?;
    let walker_config = WalkerConfig::from_env()?;
    let endpoints = Endpoints::from_env();

    let from = clock.day_to_slot_range(since).from;
    let to = match until {
        Some(day) => clock.day_to_slot_range(day).to,
        None => current_bound(&endpoints, &clock).await,
    };
    if to < from {
        anyhow::bail!("Backfill range is empty: {} is after the upper bound", since);
    }
    let target = SlotRange::new(from, to);
    info!(target = %target, relays = registry.relays.len(), "Starting backfill");

    let store = open_store(db_path)?;
    let reports = run_backfill(
        registry.relays,
        relay_client_factory(policy),
        store,
        walker_config,
        target,
    )
    .await;

    println!();
    println!("{:<24} {:>6} {:>12}  {}", "relay", "walks", "stored", "outcome");
    for report in &reports {
        let outcome = match &report.error {
            Some(e) => format!("error: {}", e),
            None => report
                .walks
                .iter()
                .map(|w| format!("{:?}", w.outcome))
                .collect::<Vec<_>>()
                .join(","),
        };
        println!(
            "{:<24} {:>6} {:>12}  {}",
            report.source,
            report.walks.len(),
            report.records_stored(),
            outcome
        );
    }
    Ok(())
}

fn cmd_detect_gaps(
    db_path: &str,
    clock: SlotClock,
    from: NaiveDate,
    to: NaiveDate,
    out: &str,
    threshold_pct: f64,
    merge_threshold: Slot,
) -> Result<()> {
    let store = open_store(db_path)?;
    let counts = store.daily_counts(&clock, from, to)?;
    info!(rows = counts.len(), "Loaded daily counts");

    let config = GapDetectorConfig {
        threshold_pct,
        ..GapDetectorConfig::default()
    };
    let raw = detect_gaps(&counts, &clock, &config);
    let raw_count = raw.len();
    let gaps = consolidate_gaps(raw, merge_threshold);
    info!(flagged = raw_count, consolidated = gaps.len(), "Gaps consolidated");

    let file = GapFile {
        generated_at: chrono::Utc::now(),
        from,
        to,
        gaps,
    };
    write_gap_file(out, &file)?;

    for gap in &file.gaps {
        println!(
            "{:<24} [{}, {}] estimate={} days={}",
            gap.source,
            gap.from_slot,
            gap.to_slot,
            gap.estimated_missing,
            gap.dates.len()
        );
    }
    Ok(())
}

async fn cmd_retry_gaps(db_path: &str, registry: RelayRegistry, input: &str) -> Result<()> {
    let policy = RetryPolicy::from_env()?;
    let walker_config = WalkerConfig::from_env()?;
    let file = read_gap_file(input)?;
    info!(gaps = file.gaps.len(), input = %input, "Retrying gaps");

    let store = open_store(db_path)?;
    let orchestrator =
        RetryOrchestrator::new(registry, relay_client_factory(policy), store, walker_config);
    let results = orchestrator.run(file.gaps).await;

    println!();
    for r in &results {
        println!(
            "{:<24} [{}, {}] fetched={} estimated={} success={}{}",
            r.source,
            r.from_slot,
            r.to_slot,
            r.fetched_count,
            r.estimated_count,
            r.success,
            r.error
                .as_deref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
    for (source, (gaps, succeeded, fetched, estimated)) in retry::summarize(&results) {
        println!(
            "{:<24} {}/{} gaps recovered, {} fetched of ~{} estimated",
            source, succeeded, gaps, fetched, estimated
        );
    }
    Ok(())
}
