//! Snapshot calendar: the sequence of snapshot dates a run evaluates.

use crate::types::SnapshotDate;
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotCalendar {
    pub from:      SnapshotDate,
    /// Inclusive.
    pub to:        SnapshotDate,
    pub step_days: i64,
}

impl SnapshotCalendar {
    pub fn new(from: SnapshotDate, to: SnapshotDate, step_days: i64) -> Self {
        Self { from, to, step_days: step_days.max(1) }
    }

    pub fn dates(&self) -> Vec<SnapshotDate> {
        self.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = SnapshotDate> + '_ {
        let step = Duration::days(self.step_days.max(1));
        std::iter::successors(Some(self.from), move |d| Some(*d + step))
            .take_while(move |d| *d <= self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> SnapshotDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn weekly_calendar_includes_both_ends() {
        let cal = SnapshotCalendar::new(d(2025, 1, 1), d(2025, 1, 29), 7);
        assert_eq!(cal.dates(), vec![d(2025, 1, 1), d(2025, 1, 8), d(2025, 1, 15), d(2025, 1, 22), d(2025, 1, 29)]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let cal = SnapshotCalendar::new(d(2025, 2, 1), d(2025, 1, 1), 1);
        assert!(cal.dates().is_empty());
    }
}
