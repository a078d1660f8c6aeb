//! Persistent store contract and its SQLite implementation.
//!
//! Every write is an idempotent upsert keyed by a natural key, so the live
//! pipeline and any number of backfill walkers may write concurrently without
//! in-process coordination.

pub mod checkpoint;
pub mod sqlite;

use anyhow::Result;
use chrono::NaiveDate;

use crate::clock::{Slot, SlotClock, SlotRange};
use crate::models::{
    BalanceDelta, BlockRecord, BlockSummary, Checkpoint, DailyCount, RelayPayload,
};

pub use checkpoint::CheckpointTracker;
pub use sqlite::SqliteStore;

/// What the acquisition engine needs from storage.
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite a block by number (reorgs replace in place).
    fn upsert_block(&self, block: &BlockRecord) -> Result<()>;
    fn get_block(&self, number: u64) -> Result<Option<BlockRecord>>;

    /// Upsert payloads by `(slot, relay)` in one transaction. Returns rows written.
    fn upsert_payloads(&self, payloads: &[RelayPayload]) -> Result<usize>;
    fn get_payload(&self, slot: Slot, relay: &str) -> Result<Option<RelayPayload>>;
    /// Payloads of one relay with `range.from <= slot <= range.to`, ascending.
    fn payloads_in_range(&self, relay: &str, range: SlotRange) -> Result<Vec<RelayPayload>>;

    fn upsert_balance_delta(&self, delta: &BalanceDelta) -> Result<()>;
    fn upsert_summary(&self, summary: &BlockSummary) -> Result<()>;
    fn get_summary(&self, block_number: u64) -> Result<Option<BlockSummary>>;

    /// Stored payload counts per relay and UTC day, for days in `[from, to]`.
    fn daily_counts(&self, clock: &SlotClock, from: NaiveDate, to: NaiveDate)
        -> Result<Vec<DailyCount>>;

    fn get_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>>;
    /// Last-write-wins upsert, durable on return.
    fn set_checkpoint(&self, source: &str, from: Slot, to: Slot) -> Result<()>;
    fn list_checkpoints(&self) -> Result<Vec<Checkpoint>>;
}
