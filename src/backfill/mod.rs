//! Offline coverage repair: cursor walker, checkpoint-resume planner, gap
//! detection, gap consolidation and the per-relay retry orchestrator.

pub mod consolidate;
pub mod gaps;
pub mod planner;
pub mod retry;
pub mod walker;

use std::sync::Arc;

use crate::config::{RelayInfo, RetryPolicy};
use crate::sources::{PayloadSource, RelayClient};

pub use consolidate::{consolidate_gaps, DEFAULT_MERGE_THRESHOLD};
pub use gaps::{detect_gaps, read_gap_file, write_gap_file, GapDetectorConfig, GapFile, GapRecord};
pub use planner::{plan_tasks, run_backfill, BackfillTask, SourceBackfillReport};
pub use retry::{GapResult, RetryOrchestrator};
pub use walker::{CursorWalker, Direction, WalkOutcome, WalkReport};

/// Builds a fresh source per relay task so concurrent relays never share
/// request state.
pub type SourceFactory =
    Arc<dyn Fn(&RelayInfo) -> anyhow::Result<Box<dyn PayloadSource>> + Send + Sync>;

/// Factory producing HTTP relay clients.
pub fn relay_client_factory(policy: RetryPolicy) -> SourceFactory {
    Arc::new(move |info: &RelayInfo| {
        let client = RelayClient::new(info.clone(), policy)?;
        Ok(Box::new(client) as Box<dyn PayloadSource>)
    })
}
