//! Gap Detector
//!
//! Judges each relay against its own daily baseline. A day is a gap when its
//! count is below `threshold_pct` of the relay's mean, or more than
//! `std_devs` standard deviations below it. Flagged days become slot ranges
//! annotated with the shortfall `mean - actual`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::clock::{Slot, SlotClock};
use crate::models::DailyCount;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GapDetectorConfig {
    /// Fraction of the mean below which a day is flagged.
    pub threshold_pct: f64,
    /// Standard deviations below the mean at which a day is flagged.
    pub std_devs: f64,
    /// Sources with fewer observed days are not judged.
    pub min_days: usize,
}

impl Default for GapDetectorConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 0.5,
            std_devs: 2.0,
            min_days: 3,
        }
    }
}

/// A sub-range of slots where one source looks under-covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub source: String,
    pub from_slot: Slot,
    pub to_slot: Slot,
    /// Estimated number of missing records.
    #[serde(rename = "estimate")]
    pub estimated_missing: u64,
    /// Calendar days this gap was derived from.
    #[serde(default)]
    pub dates: Vec<NaiveDate>,
}

/// Serialized gap list handed from `detect-gaps` to `retry-gaps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapFile {
    pub generated_at: DateTime<Utc>,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub gaps: Vec<GapRecord>,
}

pub fn write_gap_file(path: impl AsRef<Path>, file: &GapFile) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(file).context("Failed to serialize gap list")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write gap file {}", path.display()))?;
    info!(path = %path.display(), gaps = file.gaps.len(), "Gap file written");
    Ok(())
}

pub fn read_gap_file(path: impl AsRef<Path>) -> Result<GapFile> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gap file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse gap file {}", path.display()))
}

/// Per-source daily series with days missing inside the observed window
/// filled with zero (a full-day outage produces no aggregate row).
fn daily_series(counts: &[DailyCount]) -> BTreeMap<&str, BTreeMap<NaiveDate, u64>> {
    let mut by_source: BTreeMap<&str, BTreeMap<NaiveDate, u64>> = BTreeMap::new();
    for c in counts {
        *by_source
            .entry(c.source.as_str())
            .or_default()
            .entry(c.day)
            .or_insert(0) += c.count;
    }

    for days in by_source.values_mut() {
        let (Some(first), Some(last)) = (
            days.keys().next().copied(),
            days.keys().next_back().copied(),
        ) else {
            continue;
        };
        let mut day = first;
        while day < last {
            days.entry(day).or_insert(0);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
    }
    by_source
}

pub fn detect_gaps(
    counts: &[DailyCount],
    clock: &SlotClock,
    config: &GapDetectorConfig,
) -> Vec<GapRecord> {
    let mut gaps = Vec::new();

    for (source, days) in daily_series(counts) {
        if days.len() < config.min_days {
            debug!(relay = %source, days = days.len(), "Too few days to judge");
            continue;
        }

        let values: Vec<f64> = days.values().map(|c| *c as f64).collect();
        let mean = values.iter().mean();
        let std_dev = values.iter().std_dev();
        let pct_floor = mean * config.threshold_pct;
        let sigma_floor = mean - config.std_devs * std_dev;

        for (day, count) in &days {
            let actual = *count as f64;
            if actual < pct_floor || actual < sigma_floor {
                let range = clock.day_to_slot_range(*day);
                gaps.push(GapRecord {
                    source: source.to_string(),
                    from_slot: range.from,
                    to_slot: range.to,
                    estimated_missing: (mean - actual).max(0.0).round() as u64,
                    dates: vec![*day],
                });
            }
        }

        debug!(relay = %source, mean, std_dev, "Baseline computed");
    }

    info!(gaps = gaps.len(), "Gap detection finished");
    gaps
}
