//! Lifecycle state classifier.
//!
//! `classify` is a pure function of the provider's cycles and program events
//! visible before the snapshot date. Nothing is cached between snapshots:
//! recomputation is what keeps classification repeatable.
//!
//! Evaluation order on the latest visible cycle:
//!   1. explicit cancellation            → CANCELLED
//!   2. pause active at the snapshot     → FROZEN
//!   3. past the effective end           → EXPIRED (in grace) / CHURNED
//!   4. inside the renewal lead window   → EXPIRING_THIS_MONTH / UP_FOR_RENEWAL
//!   5. inside the opening window        → NEW / RENEWAL / REACTIVATED
//!   6. otherwise                        → ACTIVE
//!
//! AT_RISK is an overlay applied by `apply_score`, never a hard state.

use crate::{
    config::{ChurnThresholds, PipelineConfig},
    cycle::{pause_intervals, same_month, SubscriptionCycle},
    provider::ProgramEvent,
    types::{ProviderKey, SnapshotDate},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    New,
    Active,
    Renewal,
    Reactivated,
    UpForRenewal,
    ExpiringThisMonth,
    Frozen,
    Expired,
    Cancelled,
    Churned,
    AtRisk,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New               => "NEW",
            Self::Active            => "ACTIVE",
            Self::Renewal           => "RENEWAL",
            Self::Reactivated       => "REACTIVATED",
            Self::UpForRenewal      => "UP_FOR_RENEWAL",
            Self::ExpiringThisMonth => "EXPIRING_THIS_MONTH",
            Self::Frozen            => "FROZEN",
            Self::Expired           => "EXPIRED",
            Self::Cancelled         => "CANCELLED",
            Self::Churned           => "CHURNED",
            Self::AtRisk            => "AT_RISK",
        }
    }

    /// Statuses of a provider whose cycle is still running.
    pub fn is_in_cycle(&self) -> bool {
        matches!(
            self,
            Self::New
                | Self::Active
                | Self::Renewal
                | Self::Reactivated
                | Self::UpForRenewal
                | Self::ExpiringThisMonth
        )
    }
}

/// How the provider arrived at its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    New,
    Renewal,
    Reactivated,
    Frozen,
    Expired,
    Cancelled,
    UpForRenewal,
    ExpiringThisMonth,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New               => "NEW",
            Self::Renewal           => "RENEWAL",
            Self::Reactivated       => "REACTIVATED",
            Self::Frozen            => "FROZEN",
            Self::Expired           => "EXPIRED",
            Self::Cancelled         => "CANCELLED",
            Self::UpForRenewal      => "UP_FOR_RENEWAL",
            Self::ExpiringThisMonth => "EXPIRING_THIS_MONTH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChurnBand {
    Minimal,
    Low,
    Medium,
    High,
    Imminent,
}

impl ChurnBand {
    pub fn from_probability(p: f64, t: &ChurnThresholds) -> Self {
        if p >= t.imminent_churn {
            Self::Imminent
        } else if p >= t.high_risk {
            Self::High
        } else if p >= t.medium_risk {
            Self::Medium
        } else if p >= t.low_risk {
            Self::Low
        } else {
            Self::Minimal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal  => "MINIMAL",
            Self::Low      => "LOW",
            Self::Medium   => "MEDIUM",
            Self::High     => "HIGH",
            Self::Imminent => "IMMINENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSnapshot {
    pub provider_id:            ProviderKey,
    pub as_of:                  SnapshotDate,
    pub status:                 SubscriptionStatus,
    pub event_type:             LifecycleEvent,
    pub cycle:                  SubscriptionCycle,
    pub days_in_cycle:          i64,
    /// Days until the effective end; negative once it has passed.
    pub days_to_cycle_end:      i64,
    pub is_in_grace_period:     bool,
    pub renewal_booked:         bool,
    pub churn_label:            bool,
    pub prior_churn_count:      u32,
    pub previous_cycle_churned: bool,
    pub churn_probability:      Option<f64>,
    pub churn_band:             Option<ChurnBand>,
    pub is_at_risk:             bool,
}

impl LifecycleSnapshot {
    /// Attach a churn probability and derive band and the AT_RISK overlay.
    pub fn apply_score(&mut self, probability: f64, config: &PipelineConfig) {
        let t = &config.scoring.thresholds;
        self.churn_probability = Some(probability);
        self.churn_band = Some(ChurnBand::from_probability(probability, t));
        self.is_at_risk =
            self.status.is_in_cycle() && probability >= config.scoring.at_risk_threshold;
    }

    /// Status as reported to consumers: the hard state, or AT_RISK when the
    /// overlay applies.
    pub fn lifecycle_label(&self) -> SubscriptionStatus {
        if self.is_at_risk {
            SubscriptionStatus::AtRisk
        } else {
            self.status
        }
    }
}

/// Whether the provider churned between `prev` and the cycle opened on
/// `next_start`: an explicit cancellation, or a gap longer than `prev`'s
/// own grace period.
pub fn churned_between(prev: &SubscriptionCycle, next_start: SnapshotDate) -> bool {
    prev.cancelled_on.is_some() || next_start >= prev.grace_end()
}

/// Classify a provider at `as_of`. `cycles` come from `derive_cycles` for the
/// same date; `None` when no cycle had started before `as_of`.
pub fn classify(
    cycles: &[SubscriptionCycle],
    events: &[ProgramEvent],
    as_of: SnapshotDate,
    config: &PipelineConfig,
) -> Option<LifecycleSnapshot> {
    let started = cycles.partition_point(|c| c.start_date < as_of);
    let visible = &cycles[..started];
    let current = visible.last()?;
    let renewal_booked = started < cycles.len();

    let opening = match visible.len() {
        1 => LifecycleEvent::New,
        n => {
            if churned_between(&visible[n - 2], current.start_date) {
                LifecycleEvent::Reactivated
            } else {
                LifecycleEvent::Renewal
            }
        }
    };

    let prior_churn_count = visible
        .windows(2)
        .filter(|pair| churned_between(&pair[0], pair[1].start_date))
        .count() as u32;
    let previous_cycle_churned = opening == LifecycleEvent::Reactivated;

    let effective_end = current.effective_end();
    let days_in_cycle = (as_of - current.start_date).num_days();
    let days_to_cycle_end = (effective_end - as_of).num_days();
    let paused = pause_intervals(events, as_of)
        .iter()
        .any(|p| p.is_active_at(as_of) && current.start_date <= p.paused_on);

    let mut in_grace = false;
    let (status, event_type) = if current.cancelled_on.is_some_and(|d| d < as_of) {
        (SubscriptionStatus::Cancelled, LifecycleEvent::Cancelled)
    } else if paused {
        (SubscriptionStatus::Frozen, LifecycleEvent::Frozen)
    } else if as_of >= effective_end {
        if as_of < current.grace_end() {
            in_grace = true;
            (SubscriptionStatus::Expired, LifecycleEvent::Expired)
        } else {
            (SubscriptionStatus::Churned, LifecycleEvent::Expired)
        }
    } else if days_to_cycle_end <= config.lifecycle.renewal_lead_days && !renewal_booked {
        let last_covered_day = effective_end - Duration::days(1);
        if same_month(as_of, last_covered_day) {
            (SubscriptionStatus::ExpiringThisMonth, LifecycleEvent::ExpiringThisMonth)
        } else {
            (SubscriptionStatus::UpForRenewal, LifecycleEvent::UpForRenewal)
        }
    } else if days_in_cycle < config.lifecycle.opening_window_days {
        let status = match opening {
            LifecycleEvent::New         => SubscriptionStatus::New,
            LifecycleEvent::Reactivated => SubscriptionStatus::Reactivated,
            _                           => SubscriptionStatus::Renewal,
        };
        (status, opening)
    } else {
        (SubscriptionStatus::Active, opening)
    };

    let churn_label = matches!(status, SubscriptionStatus::Churned | SubscriptionStatus::Cancelled);

    Some(LifecycleSnapshot {
        provider_id: current.provider_id.clone(),
        as_of,
        status,
        event_type,
        cycle: current.clone(),
        days_in_cycle,
        days_to_cycle_end,
        is_in_grace_period: in_grace,
        renewal_booked,
        churn_label,
        prior_churn_count,
        previous_cycle_churned,
        churn_probability: None,
        churn_band: None,
        is_at_risk: false,
    })
}
