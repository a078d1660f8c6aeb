//! Checkpoint Inspector
//!
//! Prints what the store currently covers: one checkpoint per relay, and
//! per-relay daily payload counts for a date window. Read-only.
//!
//! Usage:
//!   cargo run --release --bin checkpoint_inspect -- --db ./mevwatch.db checkpoints
//!   cargo run --release --bin checkpoint_inspect -- --db ./mevwatch.db daily \
//!       --from 2024-01-01 --to 2024-01-31

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;

use mevwatch_backend::clock::SlotClock;
use mevwatch_backend::storage::{RecordStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "checkpoint_inspect")]
#[command(about = "Inspect relay checkpoints and daily payload coverage")]
struct Args {
    /// Path to SQLite database
    #[arg(long, env = "MEVWATCH_DB_PATH", default_value = "mevwatch.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every relay checkpoint
    Checkpoints,

    /// Payload counts per relay per UTC day
    Daily {
        /// First day (default: 7 days ago)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day (default: today)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkpoint_inspect=info,mevwatch_backend=warn".into()),
        )
        .init();

    let args = Args::parse();
    let store = SqliteStore::open_read_only(&args.db)
        .with_context(|| format!("Failed to open database {}", args.db))?;
    let clock = SlotClock::mainnet();

    match args.command {
        Commands::Checkpoints => print_checkpoints(&store, &clock),
        Commands::Daily { from, to } => {
            let to = to.unwrap_or_else(|| Utc::now().date_naive());
            let from = from.unwrap_or(to - Duration::days(7));
            print_daily(&store, &clock, from, to)
        }
    }
}

fn print_checkpoints(store: &SqliteStore, clock: &SlotClock) -> Result<()> {
    let checkpoints = store.list_checkpoints()?;
    if checkpoints.is_empty() {
        println!("No checkpoints recorded.");
        return Ok(());
    }

    println!(
        "{:<24} {:>12} {:>12} {:>12}  {:<10} {:<10}  {}",
        "relay", "from_slot", "to_slot", "slots", "from_day", "to_day", "updated"
    );
    for cp in &checkpoints {
        println!(
            "{:<24} {:>12} {:>12} {:>12}  {:<10} {:<10}  {}",
            cp.source,
            cp.from_slot,
            cp.to_slot,
            cp.to_slot.saturating_sub(cp.from_slot) + 1,
            clock.slot_to_day(cp.from_slot),
            clock.slot_to_day(cp.to_slot),
            DateTime::from_timestamp(cp.updated_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| cp.updated_at.to_string())
        );
    }
    println!();
    println!("Total payloads stored: {}", store.payload_count()?);
    Ok(())
}

fn print_daily(store: &SqliteStore, clock: &SlotClock, from: NaiveDate, to: NaiveDate) -> Result<()> {
    let counts = store.daily_counts(clock, from, to)?;
    if counts.is_empty() {
        println!("No payloads between {} and {}.", from, to);
        return Ok(());
    }

    let mut by_relay: BTreeMap<&str, Vec<(NaiveDate, u64)>> = BTreeMap::new();
    for c in &counts {
        by_relay.entry(&c.source).or_default().push((c.day, c.count));
    }

    for (relay, days) in by_relay {
        let total: u64 = days.iter().map(|(_, n)| n).sum();
        println!("{} ({} days, {} payloads)", relay, days.len(), total);
        for (day, n) in days {
            println!("  {}  {:>8}", day, n);
        }
    }
    Ok(())
}
