//! Cursor Backfill Walker
//!
//! Walks one source backward from the top of a target slot range:
//! - non-empty page: persist the in-range records, advance the watermark,
//!   continue below the oldest fetched slot
//! - empty page: step back one slot, and after `empty_streak_threshold`
//!   empties in a row jump back by `jump_stride` slots instead
//! - a hard cap on fetch attempts bounds the walk; progress is checkpointed
//!   after every page so a capped or crashed walk loses nothing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::{Slot, SlotRange};
use crate::config::WalkerConfig;
use crate::models::CoveredRange;
use crate::sources::PayloadSource;
use crate::storage::{CheckpointTracker, RecordStore};

/// Which end of the checkpoint a walk extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// New data above the checkpoint: `to` grows to the target's upper bound.
    TowardPresent,
    /// History below the checkpoint: `from` shrinks.
    TowardPast,
}

/// Terminal state of a walk. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkOutcome {
    /// Reached the lower bound of the target.
    Completed,
    /// Fetch attempt cap hit; partial progress is checkpointed.
    CapExhausted,
    /// The cursor did not move between two fetches.
    Stuck,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkReport {
    pub source: String,
    pub target: SlotRange,
    pub direction: Direction,
    pub outcome: WalkOutcome,
    pub fetch_attempts: u32,
    pub pages: u32,
    pub jumps: u32,
    pub records_stored: u64,
    pub final_cursor: Slot,
    pub covered: Option<CoveredRange>,
}

/// What to do after one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue(Slot),
    Jump(Slot),
    Done,
    Stuck,
}

pub struct CursorWalker<'a> {
    source: &'a dyn PayloadSource,
    store: Arc<dyn RecordStore>,
    checkpoints: CheckpointTracker,
    config: WalkerConfig,
}

impl<'a> CursorWalker<'a> {
    pub fn new(
        source: &'a dyn PayloadSource,
        store: Arc<dyn RecordStore>,
        config: WalkerConfig,
    ) -> Self {
        let checkpoints = CheckpointTracker::new(store.clone());
        Self {
            source,
            store,
            checkpoints,
            config,
        }
    }

    /// Watermark after persisting records down to `min_stored`.
    fn advance(
        existing: Option<CoveredRange>,
        target: SlotRange,
        direction: Direction,
        lowest: Slot,
    ) -> CoveredRange {
        let to = match (direction, existing) {
            (Direction::TowardPresent, Some(cp)) => cp.to.max(target.to),
            (Direction::TowardPast, Some(cp)) => cp.to,
            (_, None) => target.to,
        };
        let from = existing.map_or(lowest, |cp| cp.from.min(lowest));
        CoveredRange { from, to }
    }

    /// Walk `target` from its upper bound down.
    pub async fn walk(&self, target: SlotRange, direction: Direction) -> Result<WalkReport> {
        let source_id = self.source.source_id().to_string();
        let mut covered = self
            .checkpoints
            .get(&source_id)
            .with_context(|| format!("Failed to read checkpoint for {}", source_id))?;

        info!(
            relay = %source_id,
            target = %target,
            ?direction,
            ?covered,
            "Walker starting"
        );

        let mut cursor = target.to;
        let mut empty_streak: u32 = 0;
        let mut seen: HashSet<Slot> = HashSet::new();
        let mut report = WalkReport {
            source: source_id.clone(),
            target,
            direction,
            outcome: WalkOutcome::CapExhausted,
            fetch_attempts: 0,
            pages: 0,
            jumps: 0,
            records_stored: 0,
            final_cursor: cursor,
            covered,
        };

        loop {
            if report.fetch_attempts >= self.config.max_fetch_attempts {
                warn!(
                    relay = %source_id,
                    attempts = report.fetch_attempts,
                    cursor,
                    "Walker attempt cap reached, stopping with partial progress"
                );
                report.outcome = WalkOutcome::CapExhausted;
                break;
            }
            report.fetch_attempts += 1;

            let page = match self.source.fetch_page(cursor, self.config.page_limit).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(relay = %source_id, cursor, error = %e, "Fetch failed, treating as empty");
                    Vec::new()
                }
            };

            let step = if page.is_empty() {
                empty_streak += 1;
                if empty_streak >= self.config.empty_streak_threshold {
                    empty_streak = 0;
                    match cursor.checked_sub(self.config.jump_stride) {
                        Some(next) if next >= target.from => Step::Jump(next),
                        _ => Step::Done,
                    }
                } else if cursor > target.from {
                    Step::Continue(cursor - 1)
                } else {
                    Step::Done
                }
            } else {
                empty_streak = 0;
                report.pages += 1;

                let oldest = page.iter().map(|p| p.slot).min().unwrap_or(cursor);
                let in_range: Vec<_> = page
                    .into_iter()
                    .filter(|p| target.contains(p.slot) && seen.insert(p.slot))
                    .collect();

                if let Some(lowest) = in_range.iter().map(|p| p.slot).min() {
                    let written = self
                        .store
                        .upsert_payloads(&in_range)
                        .with_context(|| format!("Failed to persist page for {}", source_id))?;
                    report.records_stored += in_range.len() as u64;

                    let next = Self::advance(covered, target, direction, lowest);
                    self.checkpoints.set(&source_id, next.from, next.to)?;
                    covered = Some(next);
                    debug!(
                        relay = %source_id,
                        cursor,
                        stored = written,
                        oldest,
                        "Page persisted"
                    );
                }

                match oldest.checked_sub(1) {
                    None => Step::Done,
                    Some(next) if next >= cursor => Step::Stuck,
                    Some(next) if next < target.from => Step::Done,
                    Some(next) => Step::Continue(next),
                }
            };

            match step {
                Step::Continue(next) => cursor = next,
                Step::Jump(next) => {
                    report.jumps += 1;
                    debug!(relay = %source_id, from = cursor, to = next, "Empty streak, jumping back");
                    cursor = next;
                }
                Step::Done => {
                    report.outcome = WalkOutcome::Completed;
                    break;
                }
                Step::Stuck => {
                    warn!(relay = %source_id, cursor, "Cursor did not move, aborting walk");
                    report.outcome = WalkOutcome::Stuck;
                    break;
                }
            }
        }

        if report.outcome == WalkOutcome::Completed {
            let done = match covered {
                Some(cp) => CoveredRange {
                    from: cp.from.min(target.from),
                    to: Self::advance(covered, target, direction, target.from).to,
                },
                None => CoveredRange {
                    from: target.from,
                    to: target.to,
                },
            };
            self.checkpoints.set(&source_id, done.from, done.to)?;
            covered = Some(done);
        }

        report.final_cursor = cursor;
        report.covered = covered;

        info!(
            relay = %source_id,
            outcome = ?report.outcome,
            stored = report.records_stored,
            attempts = report.fetch_attempts,
            jumps = report.jumps,
            "Walker finished"
        );
        Ok(report)
    }
}
