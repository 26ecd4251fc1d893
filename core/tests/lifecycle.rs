use chrono::NaiveDate;
use churnlens_core::{
    config::PipelineConfig,
    cycle::{derive_cycles, CycleOrigin, CycleStart},
    lifecycle::{classify, ChurnBand, LifecycleEvent, LifecycleSnapshot, SubscriptionStatus},
    provider::{ProgramEvent, ProgramEventKind},
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn event(program: &str, kind: ProgramEventKind, date: NaiveDate) -> ProgramEvent {
    ProgramEvent {
        provider_id: "prv-1".into(),
        program_id:  program.into(),
        kind,
        event_date:  date,
    }
}

fn payment_start(program: &str, date: NaiveDate) -> CycleStart {
    CycleStart { date, origin: CycleOrigin::Payment, program_id: program.into() }
}

fn enrollment_start(program: &str, date: NaiveDate) -> CycleStart {
    CycleStart { date, origin: CycleOrigin::Enrollment, program_id: program.into() }
}

/// Derive cycles and classify in one go, the way the engine does.
fn classify_at(starts: &[CycleStart], events: &[ProgramEvent], as_of: NaiveDate) -> Option<LifecycleSnapshot> {
    let config = PipelineConfig::default_test();
    let cycles = derive_cycles("prv-1", starts, events, as_of, &config);
    classify(&cycles, events, as_of, &config)
}

fn status_at(starts: &[CycleStart], events: &[ProgramEvent], as_of: NaiveDate) -> SubscriptionStatus {
    classify_at(starts, events, as_of)
        .unwrap_or_else(|| panic!("expected a classification at {as_of}"))
        .status
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// Six-month cycle ending 2025-06-30 with a 15-day grace period: ten days
/// past the end the provider is in grace, not churned; twenty days past it
/// the provider has churned.
#[test]
fn grace_period_delays_churn() {
    let starts = [enrollment_start("RX_6M", d(2024, 12, 30))];

    let in_grace = classify_at(&starts, &[], d(2025, 7, 10)).unwrap();
    assert_eq!(in_grace.cycle.end_date, d(2025, 6, 30));
    assert_eq!(in_grace.status, SubscriptionStatus::Expired);
    assert!(in_grace.is_in_grace_period);
    assert!(!in_grace.churn_label);

    let churned = classify_at(&starts, &[], d(2025, 7, 20)).unwrap();
    assert_eq!(churned.status, SubscriptionStatus::Churned);
    assert!(!churned.is_in_grace_period);
    assert!(churned.churn_label);
}

/// A first cycle reports NEW during the opening window, then ACTIVE.
#[test]
fn first_cycle_new_then_active() {
    let starts = [enrollment_start("RX_3M", d(2025, 1, 1))];

    let new = classify_at(&starts, &[], d(2025, 1, 15)).unwrap();
    assert_eq!(new.status, SubscriptionStatus::New);
    assert_eq!(new.event_type, LifecycleEvent::New);
    assert_eq!(new.days_in_cycle, 14);

    assert_eq!(status_at(&starts, &[], d(2025, 2, 15)), SubscriptionStatus::Active);
}

/// Inside the renewal lead window: EXPIRING_THIS_MONTH when the last covered
/// day falls in the snapshot's month, UP_FOR_RENEWAL otherwise.
#[test]
fn renewal_lead_window_statuses() {
    // Covers 2025-01-15 .. 2025-04-14.
    let starts = [enrollment_start("RX_3M", d(2025, 1, 15))];

    assert_eq!(status_at(&starts, &[], d(2025, 3, 20)), SubscriptionStatus::UpForRenewal);
    assert_eq!(status_at(&starts, &[], d(2025, 4, 5)), SubscriptionStatus::ExpiringThisMonth);
}

/// A payment within the grace period continues the subscription as RENEWAL.
#[test]
fn restart_within_grace_is_renewal() {
    let starts = [
        enrollment_start("RX_3M", d(2025, 1, 1)),
        payment_start("RX_3M", d(2025, 4, 5)),
    ];

    let snap = classify_at(&starts, &[], d(2025, 4, 10)).unwrap();
    assert_eq!(snap.status, SubscriptionStatus::Renewal);
    assert_eq!(snap.cycle.sequence, 2);
    assert_eq!(snap.prior_churn_count, 0);
    assert!(!snap.previous_cycle_churned);
}

/// A restart after the grace period has lapsed is a REACTIVATION and the
/// lapse counts as a prior churn.
#[test]
fn restart_after_grace_is_reactivation() {
    let starts = [
        enrollment_start("RX_3M", d(2025, 1, 1)),
        payment_start("RX_3M", d(2025, 5, 10)),
    ];

    let snap = classify_at(&starts, &[], d(2025, 5, 20)).unwrap();
    assert_eq!(snap.status, SubscriptionStatus::Reactivated);
    assert_eq!(snap.event_type, LifecycleEvent::Reactivated);
    assert!(snap.previous_cycle_churned);
    assert_eq!(snap.prior_churn_count, 1);
}

/// A subscription payment inside the lead window books the next cycle at
/// the current cycle's end; the provider stays ACTIVE, not UP_FOR_RENEWAL.
#[test]
fn early_renewal_books_next_cycle() {
    let starts = [
        enrollment_start("RX_3M", d(2025, 1, 1)),
        payment_start("RX_3M", d(2025, 3, 20)),
    ];
    let config = PipelineConfig::default_test();
    let cycles = derive_cycles("prv-1", &starts, &[], d(2025, 3, 25), &config);
    assert_eq!(cycles.len(), 2);
    assert_eq!(cycles[1].start_date, d(2025, 4, 1));

    let snap = classify(&cycles, &[], d(2025, 3, 25), &config).unwrap();
    assert!(snap.renewal_booked);
    assert_eq!(snap.status, SubscriptionStatus::Active);
    assert_eq!(snap.cycle.sequence, 1);

    // Once the booked cycle starts it is a plain renewal.
    assert_eq!(status_at(&starts, &[], d(2025, 4, 10)), SubscriptionStatus::Renewal);
}

/// A mid-cycle payment outside the lead window is absorbed.
#[test]
fn mid_cycle_payment_is_absorbed() {
    let starts = [
        enrollment_start("RX_3M", d(2025, 1, 1)),
        payment_start("RX_3M", d(2025, 1, 3)),
        payment_start("RX_3M", d(2025, 2, 1)),
    ];
    let config = PipelineConfig::default_test();
    let cycles = derive_cycles("prv-1", &starts, &[], d(2025, 2, 20), &config);
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].opened_by, CycleOrigin::Enrollment);
}

/// An open pause freezes the subscription; once resumed, the paused days
/// push the cycle end out.
#[test]
fn pause_freezes_and_extends_cycle() {
    let starts = [enrollment_start("RX_3M", d(2025, 1, 1))];
    let paused = [event("RX_3M", ProgramEventKind::Paused, d(2025, 2, 1))];
    assert_eq!(status_at(&starts, &paused, d(2025, 2, 10)), SubscriptionStatus::Frozen);

    let resumed = [
        event("RX_3M", ProgramEventKind::Paused, d(2025, 2, 1)),
        event("RX_3M", ProgramEventKind::Resumed, d(2025, 2, 20)),
    ];
    let snap = classify_at(&starts, &resumed, d(2025, 3, 1)).unwrap();
    assert_eq!(snap.status, SubscriptionStatus::Active);
    assert_eq!(snap.cycle.pause_days, 19);
    assert_eq!(snap.cycle.effective_end(), d(2025, 4, 20));
}

/// An explicit cancellation wins over every other state and is a churn.
#[test]
fn cancellation_is_terminal() {
    let starts = [enrollment_start("RX_3M", d(2025, 1, 1))];
    let events = [event("RX_3M", ProgramEventKind::Cancelled, d(2025, 2, 1))];

    let snap = classify_at(&starts, &events, d(2025, 2, 10)).unwrap();
    assert_eq!(snap.status, SubscriptionStatus::Cancelled);
    assert!(snap.churn_label);

    // Not yet visible on the day itself.
    assert_eq!(status_at(&starts, &events, d(2025, 2, 1)), SubscriptionStatus::Active);
}

/// Nothing dated on or after the snapshot date is visible.
#[test]
fn start_on_snapshot_date_is_not_visible() {
    let starts = [enrollment_start("RX_3M", d(2025, 1, 1))];
    assert!(classify_at(&starts, &[], d(2025, 1, 1)).is_none());
    assert!(classify_at(&starts, &[], d(2025, 1, 2)).is_some());
}

/// Starts referencing programs missing from the reference metadata are
/// ignored.
#[test]
fn unknown_program_is_skipped() {
    let starts = [enrollment_start("RX_12M", d(2025, 1, 1))];
    assert!(classify_at(&starts, &[], d(2025, 2, 1)).is_none());
}

/// AT_RISK overlays in-cycle states only; the hard status is kept.
#[test]
fn at_risk_is_an_overlay() {
    let config = PipelineConfig::default_test();
    let starts = [enrollment_start("RX_3M", d(2025, 1, 1))];

    let mut active = classify_at(&starts, &[], d(2025, 2, 15)).unwrap();
    active.apply_score(0.7, &config);
    assert!(active.is_at_risk);
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(active.lifecycle_label(), SubscriptionStatus::AtRisk);
    assert_eq!(active.churn_band, Some(ChurnBand::High));

    let mut calm = classify_at(&starts, &[], d(2025, 2, 15)).unwrap();
    calm.apply_score(0.1, &config);
    assert!(!calm.is_at_risk);
    assert_eq!(calm.lifecycle_label(), SubscriptionStatus::Active);

    let mut churned = classify_at(&starts, &[], d(2025, 6, 1)).unwrap();
    churned.apply_score(1.0, &config);
    assert!(!churned.is_at_risk);
    assert_eq!(churned.lifecycle_label(), SubscriptionStatus::Churned);
}

#[test]
fn churn_bands_follow_thresholds() {
    let t = PipelineConfig::default_test().scoring.thresholds;
    assert_eq!(ChurnBand::from_probability(0.05, &t), ChurnBand::Minimal);
    assert_eq!(ChurnBand::from_probability(0.20, &t), ChurnBand::Low);
    assert_eq!(ChurnBand::from_probability(0.45, &t), ChurnBand::Medium);
    assert_eq!(ChurnBand::from_probability(0.84, &t), ChurnBand::High);
    assert_eq!(ChurnBand::from_probability(0.85, &t), ChurnBand::Imminent);
}

/// Same inputs, same classification.
#[test]
fn classification_is_repeatable() {
    let starts = [
        enrollment_start("RX_3M", d(2025, 1, 1)),
        payment_start("RX_3M", d(2025, 5, 10)),
    ];
    let events = [event("RX_3M", ProgramEventKind::Paused, d(2025, 6, 1))];
    let a = classify_at(&starts, &events, d(2025, 6, 15));
    let b = classify_at(&starts, &events, d(2025, 6, 15));
    assert_eq!(a, b);
}
