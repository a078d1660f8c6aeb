//! Gap Consolidator: merge near-adjacent gaps per source so fewer walks
//! cover the same shortfall.

use std::collections::BTreeMap;

use super::gaps::GapRecord;
use crate::clock::{Slot, SLOTS_PER_DAY};

/// Default merge distance: one day of slots.
pub const DEFAULT_MERGE_THRESHOLD: Slot = SLOTS_PER_DAY;

/// Merge gaps of the same source whose distance is at most `threshold` slots.
/// Output is ordered by source, then start slot.
pub fn consolidate_gaps(gaps: Vec<GapRecord>, threshold: Slot) -> Vec<GapRecord> {
    let mut by_source: BTreeMap<String, Vec<GapRecord>> = BTreeMap::new();
    for gap in gaps {
        by_source.entry(gap.source.clone()).or_default().push(gap);
    }

    let mut out = Vec::new();
    for (_, mut list) in by_source {
        list.sort_by_key(|g| (g.from_slot, g.to_slot));

        let mut iter = list.into_iter();
        let Some(mut current) = iter.next() else {
            continue;
        };
        for next in iter {
            // overlapping ranges give a zero distance
            if next.from_slot.saturating_sub(current.to_slot) <= threshold {
                current.to_slot = current.to_slot.max(next.to_slot);
                current.estimated_missing += next.estimated_missing;
                current.dates.extend(next.dates);
            } else {
                out.push(finish(current));
                current = next;
            }
        }
        out.push(finish(current));
    }
    out
}

fn finish(mut gap: GapRecord) -> GapRecord {
    gap.dates.sort_unstable();
    gap.dates.dedup();
    gap
}
