//! Checkpoint-resume planning and the per-relay backfill runner.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::walker::{CursorWalker, Direction, WalkReport};
use super::SourceFactory;
use crate::clock::SlotRange;
use crate::config::{RelayInfo, WalkerConfig};
use crate::models::CoveredRange;
use crate::storage::{CheckpointTracker, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillTask {
    pub range: SlotRange,
    pub direction: Direction,
}

/// Work still needed to cover `target` given what is already covered.
/// New data comes first.
pub fn plan_tasks(target: SlotRange, covered: Option<CoveredRange>) -> Vec<BackfillTask> {
    let Some(cp) = covered else {
        return vec![BackfillTask {
            range: target,
            direction: Direction::TowardPast,
        }];
    };

    let mut tasks = Vec::with_capacity(2);
    if cp.to < target.to {
        tasks.push(BackfillTask {
            range: SlotRange::new(cp.to.max(target.from), target.to),
            direction: Direction::TowardPresent,
        });
    }
    if cp.from > target.from {
        tasks.push(BackfillTask {
            range: SlotRange::new(target.from, cp.from.min(target.to)),
            direction: Direction::TowardPast,
        });
    }
    tasks
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceBackfillReport {
    pub source: String,
    pub tasks: Vec<BackfillTask>,
    pub walks: Vec<WalkReport>,
    pub error: Option<String>,
}

impl SourceBackfillReport {
    pub fn records_stored(&self) -> u64 {
        self.walks.iter().map(|w| w.records_stored).sum()
    }
}

async fn backfill_source(
    info: RelayInfo,
    factory: SourceFactory,
    store: Arc<dyn RecordStore>,
    config: WalkerConfig,
    target: SlotRange,
) -> anyhow::Result<SourceBackfillReport> {
    let source = factory(&info)?;
    let covered = CheckpointTracker::new(store.clone()).get(&info.id)?;
    let tasks = plan_tasks(target, covered);
    info!(relay = %info.id, ?covered, tasks = tasks.len(), "Backfill planned");

    let walker = CursorWalker::new(source.as_ref(), store, config);
    let mut walks = Vec::with_capacity(tasks.len());
    for task in &tasks {
        walks.push(walker.walk(task.range, task.direction).await?);
    }

    Ok(SourceBackfillReport {
        source: info.id,
        tasks,
        walks,
        error: None,
    })
}

/// One concurrent task per relay; a failing relay does not affect the others.
pub async fn run_backfill(
    relays: Vec<RelayInfo>,
    factory: SourceFactory,
    store: Arc<dyn RecordStore>,
    config: WalkerConfig,
    target: SlotRange,
) -> Vec<SourceBackfillReport> {
    let mut set = JoinSet::new();
    for info in relays {
        let factory = factory.clone();
        let store = store.clone();
        set.spawn(async move {
            let id = info.id.clone();
            match backfill_source(info, factory, store, config, target).await {
                Ok(report) => report,
                Err(e) => {
                    error!(relay = %id, error = %e, "Backfill failed");
                    SourceBackfillReport {
                        source: id,
                        tasks: Vec::new(),
                        walks: Vec::new(),
                        error: Some(format!("{:#}", e)),
                    }
                }
            }
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => error!(error = %e, "Backfill task panicked"),
        }
    }
    reports.sort_by(|a, b| a.source.cmp(&b.source));
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::testing::ScriptedSource;
    use crate::sources::PayloadSource;
    use crate::storage::SqliteStore;

    #[test]
    fn test_resume_infers_new_and_historical_tasks() {
        let tasks = plan_tasks(
            SlotRange::new(0, 1_000),
            Some(CoveredRange { from: 500, to: 800 }),
        );
        assert_eq!(
            tasks,
            vec![
                BackfillTask {
                    range: SlotRange::new(800, 1_000),
                    direction: Direction::TowardPresent,
                },
                BackfillTask {
                    range: SlotRange::new(0, 500),
                    direction: Direction::TowardPast,
                },
            ]
        );
    }

    #[test]
    fn test_no_checkpoint_walks_whole_target() {
        let target = SlotRange::new(10, 20);
        assert_eq!(
            plan_tasks(target, None),
            vec![BackfillTask {
                range: target,
                direction: Direction::TowardPast,
            }]
        );
    }

    #[test]
    fn test_fully_covered_target_needs_nothing() {
        let tasks = plan_tasks(
            SlotRange::new(100, 200),
            Some(CoveredRange { from: 50, to: 300 }),
        );
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failing_relay_is_isolated() {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open_memory().unwrap());
        let factory: SourceFactory = Arc::new(|info: &RelayInfo| {
            if info.id == "broken" {
                anyhow::bail!("no client for {}", info.id);
            }
            Ok(Box::new(ScriptedSource::with_slots(&info.id, vec![3, 7, 9])) as Box<dyn PayloadSource>)
        });
        let relays = vec![
            RelayInfo::new("broken", "http://127.0.0.1:1"),
            RelayInfo::new("good", "http://127.0.0.1:1"),
        ];

        let reports = run_backfill(
            relays,
            factory,
            store.clone(),
            WalkerConfig::default(),
            SlotRange::new(0, 10),
        )
        .await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].error.is_some());
        assert_eq!(reports[1].source, "good");
        assert_eq!(reports[1].records_stored(), 3);
        let cp = store.get_checkpoint("good").unwrap().unwrap();
        assert_eq!((cp.from_slot, cp.to_slot), (0, 10));
    }
}
