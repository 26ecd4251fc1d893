use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use churnlens_core::{
    config::PipelineConfig,
    cycle::{CycleOrigin, SubscriptionCycle},
    fact::FinancialPayload,
    features::{aggregate, FeatureSet},
    provider::{EngagementActivity, EngagementChannel},
    types::snapshot_boundary,
    versioning::{VersionChain, VersionUpdate},
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn at(m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, m, d, h, 0, 0).unwrap()
}

fn day(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

struct Payment {
    order:  &'static str,
    total:  f64,
    cost:   f64,
    status: &'static str,
    refund: bool,
    event:  DateTime<Utc>,
}

fn payment(order: &'static str, total: f64, event: DateTime<Utc>) -> Payment {
    Payment { order, total, cost: 60.0, status: "completed", refund: false, event }
}

fn load(chain: &mut VersionChain, p: &Payment, load_ts: DateTime<Utc>, seq: u64) {
    let payload = FinancialPayload {
        order_id:         Some(p.order.into()),
        program_id:       None,
        copay_amount:     Some(p.total * 0.2),
        insurance_amount: Some(p.total * 0.8),
        total_amount:     Some(p.total),
        cost_amount:      (!p.refund).then_some(p.cost),
        profit_amount:    None,
        payer:            Some("commercial".into()),
        payment_method:   Some("card".into()),
        status:           Some(p.status.into()),
        is_refund:        Some(p.refund),
        event_ts:         p.event,
    };
    chain.apply(&VersionUpdate {
        payment_key:  chain.payment_key.clone(),
        provider_key: "prv-1".into(),
        load_ts,
        load_seq:     seq,
        content_hash: payload.content_hash(),
        payload,
    });
}

/// One provider's ledger:
///   pay-1  ORD-1 100 on Jan 10, corrected to 150 (loaded Feb 15)
///   pay-2  ORD-2 200 on Feb 20, arrives late (loaded Mar 5)
///   pay-3  refund of 30 against ORD-1 on Feb 1
///   pay-4  declined attempt on Jan 20 (never counts)
///   pay-5  ORD-5 80 on Mar 20
fn ledger() -> Vec<VersionChain> {
    let mut p1 = VersionChain::new("pay-1".into(), "prv-1".into());
    load(&mut p1, &payment("ORD-1", 100.0, at(1, 10, 10)), at(1, 11, 2), 1);
    load(&mut p1, &payment("ORD-1", 150.0, at(1, 10, 10)), at(2, 15, 2), 5);

    let mut p2 = VersionChain::new("pay-2".into(), "prv-1".into());
    load(&mut p2, &payment("ORD-2", 200.0, at(2, 20, 10)), at(3, 5, 2), 6);

    let mut p3 = VersionChain::new("pay-3".into(), "prv-1".into());
    let refund = Payment { refund: true, ..payment("ORD-1", 30.0, at(2, 1, 10)) };
    load(&mut p3, &refund, at(2, 2, 2), 3);

    let mut p4 = VersionChain::new("pay-4".into(), "prv-1".into());
    let declined = Payment { status: "declined", ..payment("ORD-4", 500.0, at(1, 20, 10)) };
    load(&mut p4, &declined, at(1, 21, 2), 2);

    let mut p5 = VersionChain::new("pay-5".into(), "prv-1".into());
    load(&mut p5, &payment("ORD-5", 80.0, at(3, 20, 10)), at(3, 21, 2), 7);

    vec![p1, p2, p3, p4, p5]
}

fn activities() -> Vec<EngagementActivity> {
    let activity = |channel, occurred_at| EngagementActivity {
        provider_id: "prv-1".into(),
        channel,
        activity: "touch".into(),
        occurred_at,
    };
    vec![
        activity(EngagementChannel::CallCenter, at(1, 5, 9)),
        activity(EngagementChannel::Crm, at(2, 25, 9)),
        activity(EngagementChannel::Crm, at(3, 15, 9)),
    ]
}

fn features_at(date: NaiveDate, cycle: Option<&SubscriptionCycle>) -> FeatureSet {
    let chains = ledger();
    let refs: Vec<&VersionChain> = chains.iter().collect();
    let config = PipelineConfig::default_test();
    aggregate("prv-1", &refs, &activities(), cycle, date, &config.features)
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// For every snapshot date, nothing aggregated is at or after its boundary.
#[test]
fn aggregator_never_reads_at_or_after_snapshot() {
    let mut date = day(1, 1);
    while date <= day(4, 30) {
        let fs = features_at(date, None);
        if let Some(max) = fs.max_included_ts {
            assert!(max < snapshot_boundary(date), "{date}: included {max}");
        }
        date += Duration::days(1);
    }
}

/// A correction is only visible to snapshots after its load.
#[test]
fn correction_visible_only_after_load() {
    let before = features_at(day(2, 1), None);
    assert_eq!(before.lifetime.revenue, 100.0);
    assert_eq!(before.lifetime.payment_count, 1, "declined attempt excluded");
    assert_eq!(before.lifetime.refund_count, 0, "refund on Feb 1 not yet visible");

    let after = features_at(day(3, 1), None);
    assert_eq!(after.lifetime.revenue, 150.0);
    assert_eq!(after.lifetime.refund_count, 1);
    assert_eq!(after.lifetime.refund_amount, 30.0);
    assert_eq!(after.lifetime.net_revenue, 120.0);
    assert_eq!(after.lifetime.profit, 90.0);
}

/// A payment loaded late stays invisible until its load, even though its
/// event date is earlier.
#[test]
fn late_arrival_not_visible_before_load() {
    assert_eq!(features_at(day(3, 1), None).lifetime.order_count, 1);
    assert_eq!(features_at(day(3, 10), None).lifetime.order_count, 2);
}

/// Trailing windows are `[D - n days, D)`.
#[test]
fn trailing_windows() {
    let fs = features_at(day(3, 10), None);

    let w30 = fs.window(30).unwrap();
    assert_eq!(w30.order_count, 1);
    assert_eq!(w30.revenue, 200.0);
    assert_eq!(w30.refund_count, 0);
    assert_eq!(w30.avg_gap_days, None);
    assert!(!w30.gap_exceeds_long);

    let w60 = fs.window(60).unwrap();
    assert_eq!(w60.order_count, 2);
    assert_eq!(w60.revenue, 350.0);
    assert_eq!(w60.refund_count, 1);
    assert_eq!(w60.avg_gap_days, Some(41.0));
    assert_eq!(w60.gap_variance, Some(0.0));

    assert_eq!(fs.lifetime.days_since_last_order, Some(17));
    assert_eq!(fs.lifetime.last_order_date, Some(day(2, 20)));
}

/// Trend compares the last window with the one before it; an empty prior
/// window yields no ratio instead of dividing by zero.
#[test]
fn trend_ratios_guard_zero_denominator() {
    let fs = features_at(day(3, 10), None);

    let t30 = fs.trend(30).unwrap();
    let revenue = t30.revenue_trend.unwrap();
    assert!((revenue - 50.0 / 150.0).abs() < 1e-9);
    assert_eq!(t30.order_trend, Some(0.0));

    let t90 = fs.trend(90).unwrap();
    assert_eq!(t90.revenue_trend, None);
    assert_eq!(t90.order_trend, None);
}

#[test]
fn engagement_counts_and_recency() {
    let fs = features_at(day(3, 10), None);

    let e30 = fs.engagement.windows.iter().find(|w| w.window_days == 30).unwrap();
    assert_eq!((e30.crm_count, e30.call_center_count), (1, 0));
    let e90 = fs.engagement.windows.iter().find(|w| w.window_days == 90).unwrap();
    assert_eq!((e90.crm_count, e90.call_center_count), (1, 1));

    assert_eq!(fs.engagement.days_since_last_crm, Some(12));
    assert_eq!(fs.engagement.days_since_last_contact(), Some(12));
    assert_eq!(fs.max_included_ts, Some(at(2, 25, 9)));
}

#[test]
fn cycle_aggregates_start_at_cycle_open() {
    let cycle = SubscriptionCycle {
        provider_id:         "prv-1".into(),
        program_id:          "RX_3M".into(),
        cycle_length_months: 3,
        start_date:          day(2, 1),
        end_date:            day(5, 1),
        grace_period_days:   15,
        sequence:            2,
        pause_days:          0,
        cancelled_on:        None,
        opened_by:           CycleOrigin::Payment,
    };
    let fs = features_at(day(3, 10), Some(&cycle));
    let agg = fs.cycle.unwrap();
    assert_eq!(agg.order_count, 1);
    assert_eq!(agg.revenue, 200.0);
}

/// No history at all: every ratio is undefined, nothing panics.
#[test]
fn empty_history_yields_nulls() {
    let config = PipelineConfig::default_test();
    let fs = aggregate("prv-9", &[], &[], None, day(3, 1), &config.features);
    assert_eq!(fs.lifetime.order_count, 0);
    assert_eq!(fs.lifetime.avg_order_value, None);
    assert_eq!(fs.lifetime.days_since_last_order, None);
    assert_eq!(fs.max_included_ts, None);
    assert!(fs.windows.iter().all(|w| w.order_count == 0 && w.avg_gap_days.is_none()));
    assert_eq!(fs.avg_monthly_profit(), Some(0.0));
}
