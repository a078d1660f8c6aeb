//! Slot Clock
//!
//! Maps beacon-chain slots to wall-clock time and back.
//! Pure and stateless: every other component converts between time ranges and
//! slot ranges through these functions.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Mainnet beacon-chain genesis (Unix seconds).
pub const MAINNET_GENESIS_SECS: i64 = 1_606_824_023;

/// Mainnet slot duration in seconds.
pub const SLOT_DURATION_SECS: i64 = 12;

/// Slots in a standard 24h day.
pub const SLOTS_PER_DAY: u64 = (86_400 / SLOT_DURATION_SECS) as u64;

/// Slot index.
pub type Slot = u64;

/// Inclusive slot range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub from: Slot,
    pub to: Slot,
}

impl SlotRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(a: Slot, b: Slot) -> Self {
        if a <= b {
            Self { from: a, to: b }
        } else {
            Self { from: b, to: a }
        }
    }

    #[inline]
    pub fn contains(&self, slot: Slot) -> bool {
        slot >= self.from && slot <= self.to
    }

    /// Number of slots covered (both bounds included).
    #[inline]
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Genesis + slot duration pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClock {
    genesis_secs: i64,
    slot_secs: i64,
}

impl Default for SlotClock {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl SlotClock {
    pub const fn new(genesis_secs: i64, slot_secs: i64) -> Self {
        Self {
            genesis_secs,
            slot_secs,
        }
    }

    pub const fn mainnet() -> Self {
        Self::new(MAINNET_GENESIS_SECS, SLOT_DURATION_SECS)
    }

    #[inline]
    pub fn genesis_secs(&self) -> i64 {
        self.genesis_secs
    }

    #[inline]
    pub fn slot_secs(&self) -> i64 {
        self.slot_secs
    }

    /// `genesis + slot * slot_duration`, in Unix seconds. Saturates at
    /// `i64::MAX` for slots past the representable range.
    #[inline]
    pub fn slot_to_unix(&self, slot: Slot) -> i64 {
        i64::try_from(slot)
            .ok()
            .and_then(|s| s.checked_mul(self.slot_secs))
            .and_then(|offset| offset.checked_add(self.genesis_secs))
            .unwrap_or(i64::MAX)
    }

    /// `floor((t - genesis) / slot_duration)`, clamped to zero.
    #[inline]
    pub fn unix_to_slot(&self, unix_secs: i64) -> Slot {
        let elapsed = unix_secs - self.genesis_secs;
        if elapsed <= 0 {
            return 0;
        }
        (elapsed / self.slot_secs) as Slot
    }

    pub fn slot_to_time(&self, slot: Slot) -> DateTime<Utc> {
        let secs = self.slot_to_unix(slot);
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn time_to_slot(&self, time: DateTime<Utc>) -> Slot {
        self.unix_to_slot(time.timestamp())
    }

    /// First slot whose start time is at or after `unix_secs`.
    fn first_slot_at_or_after(&self, unix_secs: i64) -> Slot {
        let elapsed = unix_secs - self.genesis_secs;
        if elapsed <= 0 {
            return 0;
        }
        ((elapsed + self.slot_secs - 1) / self.slot_secs) as Slot
    }

    /// Inclusive range of slots whose start time falls on a UTC calendar day.
    pub fn day_to_slot_range(&self, day: NaiveDate) -> SlotRange {
        let start = day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        let next = start + chrono::Duration::days(1);
        let from = self.first_slot_at_or_after(start.timestamp());
        let next_from = self.first_slot_at_or_after(next.timestamp());
        SlotRange::new(from, next_from.saturating_sub(1).max(from))
    }

    /// UTC calendar day a slot falls in.
    pub fn slot_to_day(&self, slot: Slot) -> NaiveDate {
        self.slot_to_time(slot).date_naive()
    }

    /// Slot that is current at the local wall clock.
    pub fn current_slot(&self) -> Slot {
        self.time_to_slot(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_time_round_trip() {
        let clock = SlotClock::mainnet();
        for slot in [0u64, 1, 11, 7_200, 4_700_013, 9_999_999, 12_345_678] {
            let t = clock.slot_to_time(slot);
            assert_eq!(clock.time_to_slot(t), slot);
        }
    }

    #[test]
    fn test_time_before_genesis_clamps_to_zero() {
        let clock = SlotClock::mainnet();
        assert_eq!(clock.unix_to_slot(0), 0);
        assert_eq!(clock.unix_to_slot(MAINNET_GENESIS_SECS - 1), 0);
        assert_eq!(clock.unix_to_slot(MAINNET_GENESIS_SECS + 11), 0);
        assert_eq!(clock.unix_to_slot(MAINNET_GENESIS_SECS + 12), 1);
    }

    #[test]
    fn test_day_range_has_7200_slots() {
        let clock = SlotClock::mainnet();
        for (y, m, d) in [(2022, 9, 15), (2023, 1, 1), (2024, 2, 29), (2024, 12, 31)] {
            let day = NaiveDate::from_ymd_opt(y, m, d).unwrap();
            let range = clock.day_to_slot_range(day);
            assert_eq!(range.len(), SLOTS_PER_DAY, "day {}", day);
        }
    }

    #[test]
    fn test_consecutive_days_are_adjacent() {
        let clock = SlotClock::mainnet();
        let d1 = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let d2 = d1.succ_opt().unwrap();
        let r1 = clock.day_to_slot_range(d1);
        let r2 = clock.day_to_slot_range(d2);
        assert_eq!(r1.to + 1, r2.from);
        assert_eq!(clock.slot_to_day(r1.from), d1);
        assert_eq!(clock.slot_to_day(r1.to), d1);
        assert_eq!(clock.slot_to_day(r2.from), d2);
    }

    #[test]
    fn test_slot_range_normalizes_bounds() {
        let r = SlotRange::new(300, 100);
        assert_eq!(r.from, 100);
        assert_eq!(r.to, 300);
        assert!(r.contains(100) && r.contains(300));
        assert!(!r.contains(301));
    }

    #[test]
    fn test_huge_slot_saturates() {
        let clock = SlotClock::mainnet();
        assert_eq!(clock.slot_to_unix(u64::MAX), i64::MAX);
        assert_eq!(clock.slot_to_unix(i64::MAX as u64 / 6), i64::MAX);
        assert_eq!(clock.slot_to_time(u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
