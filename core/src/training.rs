//! Training table builder: one wide row per (provider, snapshot date).
//!
//! Rows are materialized by `PipelineStore::upsert_feature_rows`, keyed by
//! `(snapshot_date, provider_id)`: a re-run for the same date replaces the
//! whole partition.
//! Partition exports land in `<out>/snapshot_date=YYYY-MM-DD/features.csv`.

use crate::{
    config::ProgramDefinition,
    error::{PipelineError, PipelineResult},
    features::FeatureSet,
    lifecycle::LifecycleSnapshot,
    provider::ProviderProfile,
    scoring::ChurnScore,
    types::{snapshot_boundary, ProviderKey, SnapshotDate},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Text(String),
}

impl FeatureValue {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null    => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i)  => serde_json::Value::from(*i),
            Self::Num(n)  => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self { Self::Bool(v) }
}
impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self { Self::Int(v) }
}
impl From<u32> for FeatureValue {
    fn from(v: u32) -> Self { Self::Int(i64::from(v)) }
}
impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self { Self::Num(v) }
}
impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self { Self::Text(v.to_string()) }
}
impl<T: Into<FeatureValue>> From<Option<T>> for FeatureValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// One materialized training row. Key columns are typed; the full row is
/// kept as ordered named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub provider_id:       ProviderKey,
    pub snapshot_date:     SnapshotDate,
    pub cycle_end_date:    SnapshotDate,
    pub status:            String,
    pub churn_label:       bool,
    pub churn_probability: Option<f64>,
    pub columns:           Vec<(String, FeatureValue)>,
}

impl FeatureRow {
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.columns
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }
}

/// A row as read back from the table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeatureRow {
    pub provider_id:       ProviderKey,
    pub snapshot_date:     SnapshotDate,
    pub cycle_end_date:    Option<SnapshotDate>,
    pub status:            String,
    pub churn_label:       bool,
    pub churn_probability: Option<f64>,
    pub features_json:     String,
}

struct Columns(Vec<(String, FeatureValue)>);

impl Columns {
    fn put(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.0.push((name.into(), value.into()));
    }

    fn date(&mut self, name: &str, value: Option<SnapshotDate>) {
        let text = value.map(|d| d.to_string());
        self.put(name, text.as_deref());
    }
}

/// Join classifier output, features and dimensions into one row.
///
/// Fails with `Leakage` when the feature set read anything at or after the
/// snapshot boundary.
pub fn build_row(
    profile: Option<&ProviderProfile>,
    program: Option<&ProgramDefinition>,
    snapshot: &LifecycleSnapshot,
    score: &ChurnScore,
    features: &FeatureSet,
) -> PipelineResult<FeatureRow> {
    let boundary = snapshot_boundary(features.snapshot_date);
    if let Some(max_included) = features.max_included_ts.filter(|ts| *ts >= boundary) {
        return Err(PipelineError::Leakage {
            provider_id: features.provider_id.clone(),
            snapshot_date: features.snapshot_date,
            max_included,
        });
    }

    let cycle = &snapshot.cycle;
    let lt = &features.lifetime;
    let mut c = Columns(Vec::with_capacity(96));

    // Identity and onboarding
    c.put("provider_id", snapshot.provider_id.as_str());
    c.date("snapshot_date", Some(features.snapshot_date));
    c.put("npi", profile.and_then(|p| p.npi.as_deref()));
    c.put("state", profile.and_then(|p| p.state.as_deref()));
    c.put("city", profile.and_then(|p| p.city.as_deref()));
    c.date("onboarding_date", profile.and_then(|p| p.onboarding_date));
    c.put("onboarding_channel", profile.and_then(|p| p.onboarding_channel.as_deref()));
    c.put(
        "tenure_days",
        profile
            .and_then(|p| p.onboarding_date)
            .map(|d| (features.snapshot_date - d).num_days()),
    );

    // Cycle context
    c.put("program_id", cycle.program_id.as_str());
    c.put("program_label", program.map(|p| p.label.as_str()));
    c.put("cycle_length_months", cycle.cycle_length_months);
    c.date("cycle_start_date", Some(cycle.start_date));
    c.date("cycle_end_date", Some(cycle.effective_end()));
    c.put("grace_period_days", cycle.grace_period_days);
    c.put("days_in_cycle", snapshot.days_in_cycle);
    c.put("days_to_cycle_end", snapshot.days_to_cycle_end);
    c.put("cycle_number", cycle.sequence);
    c.put("cycle_opened_by", cycle.opened_by.as_str());
    c.put("pause_days", cycle.pause_days);

    // Lifecycle
    c.put("current_subscription_status", snapshot.status.as_str());
    c.put("lifecycle_event", snapshot.event_type.as_str());
    c.put("lifecycle_label", snapshot.lifecycle_label().as_str());
    c.put("is_in_grace_period", snapshot.is_in_grace_period);
    c.put("renewal_booked", snapshot.renewal_booked);
    c.put("prior_churn_count", snapshot.prior_churn_count);
    c.put("previous_cycle_churned", snapshot.previous_cycle_churned);

    // Lifetime
    c.put("lt_payment_count", lt.payment_count);
    c.put("lt_order_count", lt.order_count);
    c.put("lt_revenue", lt.revenue);
    c.put("lt_cost", lt.cost);
    c.put("lt_profit", lt.profit);
    c.put("lt_refund_count", lt.refund_count);
    c.put("lt_refund_amount", lt.refund_amount);
    c.put("lt_net_revenue", lt.net_revenue);
    c.put("lt_avg_order_value", lt.avg_order_value);
    c.put("lt_copay_share", lt.copay_share);
    c.put("lt_insurance_share", lt.insurance_share);
    c.date("first_order_date", lt.first_order_date);
    c.date("last_order_date", lt.last_order_date);
    c.put("days_since_last_order", lt.days_since_last_order);

    // Current cycle
    let cyc = features.cycle.clone().unwrap_or_default();
    c.put("cycle_order_count", cyc.order_count);
    c.put("cycle_revenue", cyc.revenue);
    c.put("cycle_profit", cyc.profit);

    // Trailing windows
    for w in &features.windows {
        let n = w.window_days;
        c.put(format!("w{n}_order_count"), w.order_count);
        c.put(format!("w{n}_revenue"), w.revenue);
        c.put(format!("w{n}_profit"), w.profit);
        c.put(format!("w{n}_refund_count"), w.refund_count);
        c.put(format!("w{n}_refund_amount"), w.refund_amount);
        c.put(format!("w{n}_avg_gap_days"), w.avg_gap_days);
        c.put(format!("w{n}_gap_variance"), w.gap_variance);
        c.put(format!("w{n}_gap_exceeds_long"), w.gap_exceeds_long);
    }
    for t in &features.trends {
        let n = t.window_days;
        c.put(format!("trend{n}_revenue"), t.revenue_trend);
        c.put(format!("trend{n}_orders"), t.order_trend);
    }

    // Engagement
    for e in &features.engagement.windows {
        let n = e.window_days;
        c.put(format!("eng{n}_crm_count"), e.crm_count);
        c.put(format!("eng{n}_call_center_count"), e.call_center_count);
    }
    c.put("days_since_last_crm", features.engagement.days_since_last_crm);
    c.put("days_since_last_call_center", features.engagement.days_since_last_call_center);

    // Label
    c.put("churn_label", snapshot.churn_label);
    c.put("churn_probability", snapshot.churn_probability);
    c.put("churn_probability_band", snapshot.churn_band.map(|b| b.as_str()));
    c.put("lost_profit_expected", score.lost_profit_expected);

    Ok(FeatureRow {
        provider_id: snapshot.provider_id.clone(),
        snapshot_date: features.snapshot_date,
        cycle_end_date: cycle.effective_end(),
        status: snapshot.status.as_str().to_string(),
        churn_label: snapshot.churn_label,
        churn_probability: snapshot.churn_probability,
        columns: c.0,
    })
}

/// Directory of one snapshot partition under `out_dir`.
pub fn partition_dir(out_dir: &Path, snapshot_date: SnapshotDate) -> PathBuf {
    out_dir.join(format!("snapshot_date={snapshot_date}"))
}

/// Write one partition as CSV, replacing any previous export of it.
/// Column order follows the stored JSON object (sorted by name).
pub fn write_partition_csv(
    out_dir: &Path,
    snapshot_date: SnapshotDate,
    rows: &[StoredFeatureRow],
) -> PipelineResult<PathBuf> {
    let dir = partition_dir(out_dir, snapshot_date);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("features.csv");
    let mut writer = csv::Writer::from_path(&path)?;

    let mut header: Option<Vec<String>> = None;
    for row in rows {
        let value: serde_json::Value = serde_json::from_str(&row.features_json)?;
        let Some(object) = value.as_object() else { continue };

        if header.is_none() {
            let names: Vec<String> = object.keys().cloned().collect();
            writer.write_record(&names)?;
            header = Some(names);
        }
        let Some(columns) = header.as_ref() else { continue };

        let record: Vec<String> = columns
            .iter()
            .map(|name| match object.get(name) {
                None | Some(serde_json::Value::Null) => String::new(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(path)
}
