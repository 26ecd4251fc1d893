//! Churn probability: weighted additive score over point-in-time features.
//!
//! Each component is kept on the score so its contribution can be analysed
//! alongside the label. The score only ever sees a `FeatureSet` and a
//! `LifecycleSnapshot` for the same snapshot date, so it inherits their
//! no-leakage guarantee.

use crate::{
    config::ScoringConfig,
    features::FeatureSet,
    lifecycle::{LifecycleSnapshot, SubscriptionStatus},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnScore {
    pub probability:                  f64,
    // Components
    pub base_rate:                    f64,
    pub recency_component:            f64,
    pub revenue_decline_component:    f64,
    pub long_gap_component:           f64,
    pub refund_rate_component:        f64,
    pub engagement_silence_component: f64,
    pub prior_churn_component:        f64,
    pub grace_period_component:       f64,
    /// Expected profit lost if the provider churns at this probability.
    pub lost_profit_expected:         Option<f64>,
}

pub fn score(features: &FeatureSet, snapshot: &LifecycleSnapshot, config: &ScoringConfig) -> ChurnScore {
    let w = &config.weights;

    // Recency saturates at the horizon; no order at all is maximal.
    let recency_component = match features.lifetime.days_since_last_order {
        Some(d) => w.recency_weight * (d as f64 / w.recency_horizon_days.max(1) as f64).min(1.0),
        None => w.recency_weight,
    };

    // Revenue decline over the 90-day trend (growth never lowers risk here)
    let revenue_decline_component = features
        .trend(90)
        .and_then(|t| t.revenue_trend)
        .map(|r| w.revenue_decline_weight * (-r).clamp(0.0, 1.0))
        .unwrap_or(0.0);

    let long_gap_component = if features.window(90).is_some_and(|wa| wa.gap_exceeds_long) {
        w.long_gap_weight
    } else {
        0.0
    };

    let refund_rate_component = if features.lifetime.payment_count > 0 {
        w.refund_rate_weight
            * (features.lifetime.refund_count as f64 / features.lifetime.payment_count as f64)
    } else {
        0.0
    };

    let engagement_silence_component = match features.engagement.days_since_last_contact() {
        Some(d) if d <= w.engagement_silence_days => 0.0,
        _ => w.engagement_silence_weight,
    };

    let prior_churn_component =
        w.prior_churn_weight * (snapshot.prior_churn_count.min(3) as f64 / 3.0);

    let grace_period_component = if snapshot.is_in_grace_period {
        w.grace_period_weight
    } else {
        0.0
    };

    let probability = match snapshot.status {
        // Observed outcome, not a prediction.
        SubscriptionStatus::Churned | SubscriptionStatus::Cancelled => 1.0,
        _ => (w.base_rate
            + recency_component
            + revenue_decline_component
            + long_gap_component
            + refund_rate_component
            + engagement_silence_component
            + prior_churn_component
            + grace_period_component)
            .clamp(0.0, 1.0),
    };

    let lost_profit_expected = features
        .avg_monthly_profit()
        .map(|monthly| probability * monthly * snapshot.cycle.cycle_length_months as f64);

    ChurnScore {
        probability,
        base_rate: w.base_rate,
        recency_component,
        revenue_decline_component,
        long_gap_component,
        refund_rate_component,
        engagement_silence_component,
        prior_churn_component,
        grace_period_component,
        lost_profit_expected,
    }
}
