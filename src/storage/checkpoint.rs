//! Checkpoint Tracker
//!
//! Per-source `(earliest_covered, latest_covered)` watermark. Every `set` is
//! committed before it returns so a restarted backfill resumes where the last
//! persisted page left off.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use super::RecordStore;
use crate::clock::Slot;
use crate::models::CoveredRange;

#[derive(Clone)]
pub struct CheckpointTracker {
    store: Arc<dyn RecordStore>,
}

impl CheckpointTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, source: &str) -> Result<Option<CoveredRange>> {
        Ok(self.store.get_checkpoint(source)?.map(|cp| CoveredRange {
            from: cp.from_slot,
            to: cp.to_slot,
        }))
    }

    /// Last-write-wins. Monotonicity is the caller's concern.
    pub fn set(&self, source: &str, from: Slot, to: Slot) -> Result<()> {
        self.store.set_checkpoint(source, from, to)?;
        debug!(source = %source, from, to, "Checkpoint persisted");
        Ok(())
    }
}
