//! Feature aggregator: point-in-time aggregates for one provider.
//!
//! RULE: nothing dated at or after the snapshot boundary is read. Payloads
//! come from `VersionChain::visible_before`, facts are filtered on
//! `event_ts < boundary`, engagement comes from `activities_before`. The
//! largest timestamp actually read is reported in `max_included_ts` so the
//! rule can be checked from outside.

use crate::{
    config::FeatureConfig,
    cycle::SubscriptionCycle,
    fact::FinancialPayload,
    provider::{EngagementActivity, EngagementChannel},
    types::{snapshot_boundary, ProviderKey, SnapshotDate, Timestamp},
    versioning::VersionChain,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeAggregates {
    pub payment_count:         u32,
    pub order_count:           u32,
    pub revenue:               f64,
    pub cost:                  f64,
    pub profit:                f64,
    pub refund_count:          u32,
    pub refund_amount:         f64,
    pub net_revenue:           f64,
    pub avg_order_value:       Option<f64>,
    pub copay_share:           Option<f64>,
    pub insurance_share:       Option<f64>,
    pub first_order_date:      Option<SnapshotDate>,
    pub last_order_date:       Option<SnapshotDate>,
    pub days_since_last_order: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowAggregates {
    pub window_days:      i64,
    pub order_count:      u32,
    pub revenue:          f64,
    pub profit:           f64,
    pub refund_count:     u32,
    pub refund_amount:    f64,
    pub avg_gap_days:     Option<f64>,
    pub gap_variance:     Option<f64>,
    /// Some inter-order gap, or the trailing gap to the snapshot, exceeds
    /// `long_gap_days`.
    pub gap_exceeds_long: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRatios {
    pub window_days:   i64,
    pub revenue_trend: Option<f64>,
    pub order_trend:   Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleAggregates {
    pub order_count: u32,
    pub revenue:     f64,
    pub profit:      f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementWindow {
    pub window_days:       i64,
    pub crm_count:         u32,
    pub call_center_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementAggregates {
    pub windows:                    Vec<EngagementWindow>,
    pub days_since_last_crm:        Option<i64>,
    pub days_since_last_call_center: Option<i64>,
}

impl EngagementAggregates {
    /// Days since the most recent contact on any channel.
    pub fn days_since_last_contact(&self) -> Option<i64> {
        match (self.days_since_last_crm, self.days_since_last_call_center) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub provider_id:     ProviderKey,
    pub snapshot_date:   SnapshotDate,
    pub lifetime:        LifetimeAggregates,
    pub windows:         Vec<WindowAggregates>,
    pub trends:          Vec<TrendRatios>,
    pub cycle:           Option<CycleAggregates>,
    pub engagement:      EngagementAggregates,
    /// Latest event timestamp of anything aggregated.
    pub max_included_ts: Option<Timestamp>,
}

impl FeatureSet {
    pub fn window(&self, days: i64) -> Option<&WindowAggregates> {
        self.windows.iter().find(|w| w.window_days == days)
    }

    pub fn trend(&self, days: i64) -> Option<&TrendRatios> {
        self.trends.iter().find(|t| t.window_days == days)
    }

    /// Average monthly profit over the 90-day window, or the longest
    /// configured window when 90 days is not configured.
    pub fn avg_monthly_profit(&self) -> Option<f64> {
        let w = self
            .window(90)
            .or_else(|| self.windows.iter().max_by_key(|w| w.window_days))?;
        Some(w.profit / (w.window_days as f64 / 30.0))
    }
}

// ── Observations ─────────────────────────────────────────────────────────────

/// One order as seen at the snapshot: every non-refund payment sharing an
/// order id is folded in, dated by its earliest payment.
#[derive(Debug, Clone)]
struct Order {
    placed_at: Timestamp,
    revenue:   f64,
    profit:    f64,
}

#[derive(Debug, Clone)]
struct Refund {
    at:     Timestamp,
    amount: f64,
}

struct Observations<'a> {
    payloads: Vec<&'a FinancialPayload>,
    orders:   Vec<Order>,
    refunds:  Vec<Refund>,
}

fn observe<'a>(
    chains: &[&'a VersionChain],
    boundary: Timestamp,
    config: &FeatureConfig,
) -> Observations<'a> {
    let mut payloads = Vec::new();
    let mut orders: BTreeMap<String, Order> = BTreeMap::new();
    let mut refunds = Vec::new();

    for chain in chains {
        let Some(version) = chain.visible_before(boundary) else { continue };
        let p = &version.payload;
        if p.event_ts >= boundary {
            continue;
        }
        if p.status.as_ref().is_some_and(|s| config.excluded_statuses.contains(s)) {
            continue;
        }
        payloads.push(p);

        let amount = p.total_amount.unwrap_or(0.0);
        if p.refund() {
            refunds.push(Refund { at: p.event_ts, amount: amount.abs() });
            continue;
        }

        let order_key = p.order_id.clone().unwrap_or_else(|| chain.payment_key.clone());
        let profit = p.effective_profit().unwrap_or(0.0);
        orders
            .entry(order_key)
            .and_modify(|o| {
                o.placed_at = o.placed_at.min(p.event_ts);
                o.revenue += amount;
                o.profit += profit;
            })
            .or_insert(Order { placed_at: p.event_ts, revenue: amount, profit });
    }

    let mut orders: Vec<Order> = orders.into_values().collect();
    orders.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then(a.revenue.total_cmp(&b.revenue)));
    refunds.sort_by(|a, b| a.at.cmp(&b.at).then(a.amount.total_cmp(&b.amount)));

    Observations { payloads, orders, refunds }
}

fn ratio(num: f64, den: f64) -> Option<f64> {
    (den != 0.0).then(|| num / den)
}

fn days(from: Timestamp, to: Timestamp) -> f64 {
    (to - from).num_seconds() as f64 / 86_400.0
}

// ── Aggregation ──────────────────────────────────────────────────────────────

/// Aggregate every feature for one provider at `snapshot_date`.
///
/// `chains` are the provider's payment chains, `activities` its engagement
/// feed, `cycle` its current cycle when classified.
pub fn aggregate(
    provider_id: &str,
    chains: &[&VersionChain],
    activities: &[EngagementActivity],
    cycle: Option<&SubscriptionCycle>,
    snapshot_date: SnapshotDate,
    config: &FeatureConfig,
) -> FeatureSet {
    let boundary = snapshot_boundary(snapshot_date);
    let obs = observe(chains, boundary, config);

    let lifetime = lifetime_aggregates(&obs, boundary);

    let windows = config
        .windows_days
        .iter()
        .map(|&n| window_aggregates(&obs, boundary, n, config.long_gap_days))
        .collect();

    let trends = config
        .windows_days
        .iter()
        .map(|&n| trend_ratios(&obs, boundary, n))
        .collect();

    let cycle = cycle.map(|c| {
        let from = snapshot_boundary(c.start_date);
        let mut agg = CycleAggregates::default();
        for o in obs.orders.iter().filter(|o| o.placed_at >= from) {
            agg.order_count += 1;
            agg.revenue += o.revenue;
            agg.profit += o.profit;
        }
        agg
    });

    let activities: Vec<&EngagementActivity> =
        activities.iter().filter(|a| a.occurred_at < boundary).collect();
    let engagement = engagement_aggregates(&activities, boundary, &config.windows_days);

    let max_included_ts = obs
        .payloads
        .iter()
        .map(|p| p.event_ts)
        .chain(activities.iter().map(|a| a.occurred_at))
        .max();

    FeatureSet {
        provider_id: provider_id.to_string(),
        snapshot_date,
        lifetime,
        windows,
        trends,
        cycle,
        engagement,
        max_included_ts,
    }
}

fn lifetime_aggregates(obs: &Observations<'_>, boundary: Timestamp) -> LifetimeAggregates {
    let mut lt = LifetimeAggregates {
        payment_count: obs.payloads.len() as u32,
        order_count: obs.orders.len() as u32,
        refund_count: obs.refunds.len() as u32,
        ..Default::default()
    };

    let mut copay = 0.0;
    let mut insurance = 0.0;
    for p in obs.payloads.iter().filter(|p| !p.refund()) {
        copay += p.copay_amount.unwrap_or(0.0);
        insurance += p.insurance_amount.unwrap_or(0.0);
        lt.cost += p.cost_amount.unwrap_or(0.0);
    }
    for o in &obs.orders {
        lt.revenue += o.revenue;
        lt.profit += o.profit;
    }
    lt.refund_amount = obs.refunds.iter().map(|r| r.amount).sum();
    lt.net_revenue = lt.revenue - lt.refund_amount;
    lt.avg_order_value = ratio(lt.revenue, lt.order_count as f64);
    lt.copay_share = ratio(copay, lt.revenue);
    lt.insurance_share = ratio(insurance, lt.revenue);

    lt.first_order_date = obs.orders.first().map(|o| o.placed_at.date_naive());
    lt.last_order_date = obs.orders.last().map(|o| o.placed_at.date_naive());
    lt.days_since_last_order = obs
        .orders
        .last()
        .map(|o| (boundary - o.placed_at).num_days());
    lt
}

fn window_aggregates(
    obs: &Observations<'_>,
    boundary: Timestamp,
    window_days: i64,
    long_gap_days: i64,
) -> WindowAggregates {
    let from = boundary - Duration::days(window_days);
    let orders: Vec<&Order> = obs
        .orders
        .iter()
        .filter(|o| from <= o.placed_at && o.placed_at < boundary)
        .collect();
    let refunds: Vec<&Refund> = obs
        .refunds
        .iter()
        .filter(|r| from <= r.at && r.at < boundary)
        .collect();

    let gaps: Vec<f64> = orders
        .windows(2)
        .map(|pair| days(pair[0].placed_at, pair[1].placed_at))
        .collect();
    let avg_gap_days = ratio(gaps.iter().sum(), gaps.len() as f64);
    let gap_variance = avg_gap_days.map(|mean| {
        gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64
    });

    let trailing_gap = orders
        .last()
        .map(|o| days(o.placed_at, boundary))
        .unwrap_or(window_days as f64);
    let long = long_gap_days as f64;
    let gap_exceeds_long = trailing_gap > long || gaps.iter().any(|g| *g > long);

    WindowAggregates {
        window_days,
        order_count: orders.len() as u32,
        revenue: orders.iter().map(|o| o.revenue).sum(),
        profit: orders.iter().map(|o| o.profit).sum(),
        refund_count: refunds.len() as u32,
        refund_amount: refunds.iter().map(|r| r.amount).sum(),
        avg_gap_days,
        gap_variance,
        gap_exceeds_long,
    }
}

fn trend_ratios(obs: &Observations<'_>, boundary: Timestamp, window_days: i64) -> TrendRatios {
    let mid = boundary - Duration::days(window_days);
    let start = mid - Duration::days(window_days);

    let (mut cur_rev, mut cur_n, mut prev_rev, mut prev_n) = (0.0, 0.0, 0.0, 0.0);
    for o in &obs.orders {
        if mid <= o.placed_at && o.placed_at < boundary {
            cur_rev += o.revenue;
            cur_n += 1.0;
        } else if start <= o.placed_at && o.placed_at < mid {
            prev_rev += o.revenue;
            prev_n += 1.0;
        }
    }

    TrendRatios {
        window_days,
        revenue_trend: ratio(cur_rev - prev_rev, prev_rev),
        order_trend: ratio(cur_n - prev_n, prev_n),
    }
}

fn engagement_aggregates(
    activities: &[&EngagementActivity],
    boundary: Timestamp,
    windows_days: &[i64],
) -> EngagementAggregates {
    let last_on = |channel: EngagementChannel| {
        activities
            .iter()
            .filter(|a| a.channel == channel)
            .map(|a| a.occurred_at)
            .max()
            .map(|t| (boundary - t).num_days())
    };

    let windows = windows_days
        .iter()
        .map(|&n| {
            let from = boundary - Duration::days(n);
            let count = |channel: EngagementChannel| {
                activities
                    .iter()
                    .filter(|a| a.channel == channel && from <= a.occurred_at)
                    .count() as u32
            };
            EngagementWindow {
                window_days: n,
                crm_count: count(EngagementChannel::Crm),
                call_center_count: count(EngagementChannel::CallCenter),
            }
        })
        .collect();

    EngagementAggregates {
        windows,
        days_since_last_crm: last_on(EngagementChannel::Crm),
        days_since_last_call_center: last_on(EngagementChannel::CallCenter),
    }
}
