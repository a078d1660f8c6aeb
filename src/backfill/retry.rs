//! Gap Retry Orchestrator
//!
//! One task per source, all sources in parallel. Within a source the gaps run
//! one at a time, most recent first, against a client built for that task
//! alone. A failed gap or a failed source never touches its siblings.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::gaps::GapRecord;
use super::walker::{CursorWalker, Direction, WalkOutcome};
use super::SourceFactory;
use crate::clock::{Slot, SlotRange};
use crate::config::{RelayRegistry, WalkerConfig};
use crate::storage::RecordStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapResult {
    pub source: String,
    pub from_slot: Slot,
    pub to_slot: Slot,
    pub estimated_count: u64,
    pub fetched_count: u64,
    pub success: bool,
    pub outcome: Option<WalkOutcome>,
    pub error: Option<String>,
}

impl GapResult {
    fn failed(gap: &GapRecord, error: String) -> Self {
        Self {
            source: gap.source.clone(),
            from_slot: gap.from_slot,
            to_slot: gap.to_slot,
            estimated_count: gap.estimated_missing,
            fetched_count: 0,
            success: false,
            outcome: None,
            error: Some(error),
        }
    }
}

pub struct RetryOrchestrator {
    registry: RelayRegistry,
    factory: SourceFactory,
    store: Arc<dyn RecordStore>,
    config: WalkerConfig,
}

impl RetryOrchestrator {
    pub fn new(
        registry: RelayRegistry,
        factory: SourceFactory,
        store: Arc<dyn RecordStore>,
        config: WalkerConfig,
    ) -> Self {
        Self {
            registry,
            factory,
            store,
            config,
        }
    }

    pub async fn run(&self, gaps: Vec<GapRecord>) -> Vec<GapResult> {
        let mut by_source: BTreeMap<String, Vec<GapRecord>> = BTreeMap::new();
        for gap in gaps {
            by_source.entry(gap.source.clone()).or_default().push(gap);
        }

        let mut results = Vec::new();
        let mut handles = Vec::new();

        for (source, mut gaps) in by_source {
            // most recent first
            gaps.sort_by(|a, b| b.to_slot.cmp(&a.to_slot));

            let Some(info) = self.registry.get(&source).cloned() else {
                warn!(relay = %source, gaps = gaps.len(), "Gaps for unknown relay, skipping");
                results.extend(
                    gaps.iter()
                        .map(|g| GapResult::failed(g, format!("unknown relay {}", source))),
                );
                continue;
            };

            let factory = self.factory.clone();
            let store = self.store.clone();
            let config = self.config;
            let task_gaps = gaps.clone();
            let handle = tokio::spawn(async move {
                let client = match factory(&info) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(relay = %info.id, error = %e, "Failed to build relay client");
                        let msg = format!("{:#}", e);
                        return task_gaps
                            .iter()
                            .map(|g| GapResult::failed(g, msg.clone()))
                            .collect::<Vec<_>>();
                    }
                };
                let walker = CursorWalker::new(client.as_ref(), store, config);

                let mut out = Vec::with_capacity(task_gaps.len());
                for gap in &task_gaps {
                    let range = SlotRange::new(gap.from_slot, gap.to_slot);
                    match walker.walk(range, Direction::TowardPast).await {
                        Ok(report) => out.push(GapResult {
                            source: gap.source.clone(),
                            from_slot: gap.from_slot,
                            to_slot: gap.to_slot,
                            estimated_count: gap.estimated_missing,
                            fetched_count: report.records_stored,
                            success: report.records_stored > 0,
                            outcome: Some(report.outcome),
                            error: None,
                        }),
                        Err(e) => {
                            error!(relay = %gap.source, range = %range, error = %e, "Gap retry failed");
                            out.push(GapResult::failed(gap, format!("{:#}", e)));
                        }
                    }
                }
                out
            });
            handles.push((gaps, handle));
        }

        for (gaps, handle) in handles {
            match handle.await {
                Ok(out) => results.extend(out),
                Err(e) => {
                    error!(error = %e, "Gap retry task panicked");
                    results.extend(gaps.iter().map(|g| GapResult::failed(g, e.to_string())));
                }
            }
        }

        for (source, list) in summarize(&results) {
            info!(
                relay = %source,
                gaps = list.0,
                succeeded = list.1,
                fetched = list.2,
                estimated = list.3,
                "Gap retry summary"
            );
        }
        results
    }
}

/// Per source: (gaps, succeeded, fetched, estimated).
pub fn summarize(results: &[GapResult]) -> BTreeMap<&str, (usize, usize, u64, u64)> {
    let mut out: BTreeMap<&str, (usize, usize, u64, u64)> = BTreeMap::new();
    for r in results {
        let entry = out.entry(r.source.as_str()).or_default();
        entry.0 += 1;
        entry.1 += r.success as usize;
        entry.2 += r.fetched_count;
        entry.3 += r.estimated_count;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::testing::ScriptedSource;
    use crate::config::RelayInfo;
    use crate::sources::PayloadSource;
    use crate::storage::SqliteStore;
    use parking_lot::Mutex;

    fn gap(source: &str, from: Slot, to: Slot) -> GapRecord {
        GapRecord {
            source: source.to_string(),
            from_slot: from,
            to_slot: to,
            estimated_missing: 5,
            dates: Vec::new(),
        }
    }

    fn registry(ids: &[&str]) -> RelayRegistry {
        RelayRegistry {
            relays: ids
                .iter()
                .map(|id| RelayInfo::new(id, "http://127.0.0.1:1"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_gaps_run_most_recent_first_and_report_counts() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let cursors: Arc<Mutex<Vec<Arc<Mutex<Vec<Slot>>>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = cursors.clone();
        let factory: SourceFactory = Arc::new(move |info: &RelayInfo| {
            let source = ScriptedSource::with_slots(&info.id, vec![150, 160, 1_050]);
            seen.lock().push(source.cursors.clone());
            Ok(Box::new(source) as Box<dyn PayloadSource>)
        });

        let orchestrator = RetryOrchestrator::new(
            registry(&["flashbots"]),
            factory,
            store,
            WalkerConfig::default(),
        );
        let results = orchestrator
            .run(vec![gap("flashbots", 100, 200), gap("flashbots", 1_000, 1_100)])
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].from_slot, 1_000);
        assert_eq!(results[0].fetched_count, 1);
        assert!(results[0].success);
        assert_eq!(results[1].from_slot, 100);
        assert_eq!(results[1].fetched_count, 2);

        let first_cursor = cursors.lock()[0].lock()[0];
        assert_eq!(first_cursor, 1_100);
    }

    #[tokio::test]
    async fn test_empty_gap_is_not_success_and_failures_are_isolated() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let factory: SourceFactory = Arc::new(|info: &RelayInfo| {
            if info.id == "broken" {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(ScriptedSource::with_slots(&info.id, Vec::new())) as Box<dyn PayloadSource>)
        });

        let orchestrator = RetryOrchestrator::new(
            registry(&["broken", "quiet"]),
            factory,
            store,
            WalkerConfig::default(),
        );
        let results = orchestrator
            .run(vec![
                gap("broken", 10, 20),
                gap("quiet", 10, 20),
                gap("ghost", 10, 20),
            ])
            .await;

        assert_eq!(results.len(), 3);
        let by_source = |s: &str| results.iter().find(|r| r.source == s).unwrap().clone();
        assert!(by_source("broken").error.is_some());
        assert!(by_source("ghost").error.is_some());
        let quiet = by_source("quiet");
        assert!(quiet.error.is_none());
        assert!(!quiet.success);
        assert_eq!(quiet.outcome, Some(WalkOutcome::Completed));

        let summary = summarize(&results);
        assert_eq!(summary["quiet"], (1, 0, 0, 5));
    }
}
