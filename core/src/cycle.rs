//! Subscription cycles: derived from enrollment events and subscription
//! payments, evaluated as of a snapshot date.
//!
//! A cycle's dates are fixed when it opens; its status is never stored here,
//! the lifecycle classifier evaluates it per snapshot.
//!
//! RULES:
//!   - Only starts and program events dated strictly before the snapshot
//!     date are visible.
//!   - A start inside a running cycle is absorbed, unless it falls within the
//!     renewal lead window, in which case the next cycle opens at the
//!     running cycle's effective end (early renewal).
//!   - A start on or after the effective end opens a new cycle on its own date.
//!   - Pause days are credited to the cycle the pause started in.

use crate::{
    config::PipelineConfig,
    provider::{ProgramEvent, ProgramEventKind},
    types::{ProgramId, ProviderKey, SnapshotDate},
};
use chrono::{Datelike, Duration, Months};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleOrigin {
    Enrollment,
    Payment,
}

impl CycleOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrollment => "ENROLLMENT",
            Self::Payment    => "PAYMENT",
        }
    }
}

/// Evidence that a provider (re)started a program on `date`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CycleStart {
    pub date:       SnapshotDate,
    pub origin:     CycleOrigin,
    pub program_id: ProgramId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCycle {
    pub provider_id:         ProviderKey,
    pub program_id:          ProgramId,
    pub cycle_length_months: u32,
    pub start_date:          SnapshotDate,
    /// Exclusive: the first day no longer covered.
    pub end_date:            SnapshotDate,
    pub grace_period_days:   i64,
    /// 1-based position in the provider's history.
    pub sequence:            u32,
    pub pause_days:          i64,
    pub cancelled_on:        Option<SnapshotDate>,
    pub opened_by:           CycleOrigin,
}

impl SubscriptionCycle {
    /// End date shifted by the days the subscription spent paused.
    pub fn effective_end(&self) -> SnapshotDate {
        self.end_date + Duration::days(self.pause_days)
    }

    /// First day on which a non-renewal counts as churn.
    pub fn grace_end(&self) -> SnapshotDate {
        self.effective_end() + Duration::days(self.grace_period_days)
    }
}

/// A pause, `resumed_on = None` while still paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseInterval {
    pub paused_on:  SnapshotDate,
    pub resumed_on: Option<SnapshotDate>,
}

impl PauseInterval {
    pub fn is_active_at(&self, date: SnapshotDate) -> bool {
        self.paused_on < date && self.resumed_on.map_or(true, |r| date <= r)
    }

    /// Paused days, counting an open pause up to `as_of`.
    pub fn days_until(&self, as_of: SnapshotDate) -> i64 {
        let end = self.resumed_on.map_or(as_of, |r| r.min(as_of));
        (end - self.paused_on).num_days().max(0)
    }
}

/// Pause intervals visible before `as_of`, in date order.
/// A RESUMED without an open pause and repeated PAUSEDs are ignored.
pub fn pause_intervals(events: &[ProgramEvent], as_of: SnapshotDate) -> Vec<PauseInterval> {
    let mut visible: Vec<&ProgramEvent> = events.iter().filter(|e| e.event_date < as_of).collect();
    visible.sort_by_key(|e| e.event_date);

    let mut out = Vec::new();
    let mut open: Option<SnapshotDate> = None;
    for e in visible {
        match (e.kind, open) {
            (ProgramEventKind::Paused, None) => open = Some(e.event_date),
            (ProgramEventKind::Resumed, Some(paused_on)) => {
                out.push(PauseInterval { paused_on, resumed_on: Some(e.event_date) });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(paused_on) = open {
        out.push(PauseInterval { paused_on, resumed_on: None });
    }
    out
}

fn pause_credit(pauses: &[PauseInterval], from: SnapshotDate, to: SnapshotDate, as_of: SnapshotDate) -> i64 {
    pauses
        .iter()
        .filter(|p| from <= p.paused_on && p.paused_on < to)
        .map(|p| p.days_until(as_of))
        .sum()
}

pub fn add_months(date: SnapshotDate, months: u32) -> SnapshotDate {
    date.checked_add_months(Months::new(months)).unwrap_or(date)
}

/// Whether `a` and `b` share a calendar month.
pub fn same_month(a: SnapshotDate, b: SnapshotDate) -> bool {
    a.year() == b.year() && a.month() == b.month()
}

/// Derive the provider's cycles visible as of `as_of`.
///
/// `starts` may be in any order and may contain duplicates; starts for
/// programs missing from the reference metadata are skipped.
pub fn derive_cycles(
    provider_id: &str,
    starts: &[CycleStart],
    events: &[ProgramEvent],
    as_of: SnapshotDate,
    config: &PipelineConfig,
) -> Vec<SubscriptionCycle> {
    let mut visible: Vec<&CycleStart> = starts.iter().filter(|s| s.date < as_of).collect();
    visible.sort();
    visible.dedup();

    let pauses = pause_intervals(events, as_of);
    let mut cancellations: Vec<&ProgramEvent> = events
        .iter()
        .filter(|e| e.kind == ProgramEventKind::Cancelled && e.event_date < as_of)
        .collect();
    cancellations.sort_by_key(|e| e.event_date);

    let lead = config.lifecycle.renewal_lead_days;
    let mut cycles: Vec<SubscriptionCycle> = Vec::new();

    for start in visible {
        let Some(program) = config.program(&start.program_id) else {
            log::debug!(
                "cycle: {provider_id} start on {} references unknown program {}",
                start.date, start.program_id
            );
            continue;
        };

        let open_on = match cycles.last_mut() {
            None => start.date,
            Some(last) => {
                if last.cancelled_on.is_none() {
                    last.cancelled_on = cancellations
                        .iter()
                        .find(|c| c.program_id == last.program_id && last.start_date <= c.event_date && c.event_date <= start.date)
                        .map(|c| c.event_date);
                }
                let credit = pause_credit(&pauses, last.start_date, start.date, as_of);
                let effective_end = last.end_date + Duration::days(credit);

                if last.cancelled_on.is_some() || start.date >= effective_end {
                    start.date
                } else if (effective_end - start.date).num_days() <= lead {
                    effective_end
                } else {
                    continue;
                }
            }
        };

        cycles.push(SubscriptionCycle {
            provider_id:         provider_id.to_string(),
            program_id:          program.program_id.clone(),
            cycle_length_months: program.cycle_length_months,
            start_date:          open_on,
            end_date:            add_months(open_on, program.cycle_length_months),
            grace_period_days:   config.grace_period_days(&program.program_id),
            sequence:            cycles.len() as u32 + 1,
            pause_days:          0,
            cancelled_on:        None,
            opened_by:           start.origin,
        });
    }

    // Final pass: pause credit and cancellations per cycle, bounded by the
    // next cycle's start.
    let next_starts: Vec<Option<SnapshotDate>> = cycles
        .iter()
        .skip(1)
        .map(|c| Some(c.start_date))
        .chain(std::iter::once(None))
        .collect();
    for (cycle, next) in cycles.iter_mut().zip(next_starts) {
        let until = next.unwrap_or(as_of);
        cycle.pause_days = pause_credit(&pauses, cycle.start_date, until, as_of);
        if cycle.cancelled_on.is_none() {
            cycle.cancelled_on = cancellations
                .iter()
                .find(|c| {
                    c.program_id == cycle.program_id
                        && cycle.start_date <= c.event_date
                        && next.map_or(true, |n| c.event_date < n)
                })
                .map(|c| c.event_date);
        }
    }

    cycles
}
