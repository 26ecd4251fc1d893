use crate::types::ProgramId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Reference metadata: program → cycle definition ─────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDefinition {
    pub program_id: ProgramId,
    pub label: String,
    /// One of 3, 6 or 9.
    pub cycle_length_months: u32,
    /// Overrides `lifecycle.default_grace_period_days` when present.
    #[serde(default)]
    pub grace_period_days: Option<i64>,
}

// ── Lifecycle classifier ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub default_grace_period_days: i64,
    /// Days before the effective cycle end at which a provider becomes
    /// UP_FOR_RENEWAL / EXPIRING_THIS_MONTH.
    pub renewal_lead_days: i64,
    /// Days after a cycle opens during which it reports NEW / RENEWAL /
    /// REACTIVATED instead of ACTIVE.
    pub opening_window_days: i64,
}

// ── Feature aggregator ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Trailing window lengths in days, e.g. [30, 60, 90, 180].
    pub windows_days: Vec<i64>,
    pub long_gap_days: i64,
    /// Payment statuses that never count as activity.
    #[serde(default)]
    pub excluded_statuses: Vec<String>,
}

// ── Churn scoring ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnWeights {
    pub base_rate: f64,
    pub recency_weight: f64,
    pub recency_horizon_days: i64,
    pub revenue_decline_weight: f64,
    pub long_gap_weight: f64,
    pub refund_rate_weight: f64,
    pub engagement_silence_weight: f64,
    pub engagement_silence_days: i64,
    pub prior_churn_weight: f64,
    pub grace_period_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnThresholds {
    pub low_risk: f64,
    pub medium_risk: f64,
    pub high_risk: f64,
    pub imminent_churn: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub weights: ChurnWeights,
    pub thresholds: ChurnThresholds,
    /// Probability at or above which an in-cycle provider is labelled AT_RISK.
    pub at_risk_threshold: f64,
}

// ── Batch execution ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Number of entity-key shards merged in parallel.
    pub shards: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct PipelineConfigFile {
    programs: Vec<ProgramDefinition>,
    lifecycle: LifecycleConfig,
    features: FeatureConfig,
    scoring: ScoringConfig,
    batch: BatchConfig,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub programs: HashMap<ProgramId, ProgramDefinition>,
    pub lifecycle: LifecycleConfig,
    pub features: FeatureConfig,
    pub scoring: ScoringConfig,
    pub batch: BatchConfig,
}

impl PipelineConfig {
    /// Load from the data/ directory.
    /// In tests, use PipelineConfig::default_test().
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/config/pipeline_config.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let file: PipelineConfigFile = serde_json::from_str(&content)?;

        let config = Self {
            programs: file
                .programs
                .into_iter()
                .map(|p| (p.program_id.clone(), p))
                .collect(),
            lifecycle: file.lifecycle,
            features: file.features,
            scoring: file.scoring,
            batch: file.batch,
        };
        config.validate().map_err(|reason| anyhow::anyhow!("{path}: {reason}"))?;
        Ok(config)
    }

    /// Reject configurations the classifier and aggregator cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.features.windows_days.is_empty() {
            return Err("features.windows_days must not be empty".into());
        }
        if let Some(w) = self.features.windows_days.iter().find(|w| **w <= 0) {
            return Err(format!("window of {w} days is not positive"));
        }
        if self.batch.shards == 0 {
            return Err("batch.shards must be at least 1".into());
        }
        let t = &self.scoring.thresholds;
        if !(t.low_risk < t.medium_risk && t.medium_risk < t.high_risk && t.high_risk < t.imminent_churn) {
            return Err("scoring.thresholds must be strictly ascending".into());
        }
        for p in self.programs.values() {
            if ![3, 6, 9].contains(&p.cycle_length_months) {
                return Err(format!(
                    "program {} has unsupported cycle length {}",
                    p.program_id, p.cycle_length_months
                ));
            }
        }
        if self.lifecycle.default_grace_period_days < 0 || self.lifecycle.renewal_lead_days < 0 {
            return Err("lifecycle day counts must not be negative".into());
        }
        Ok(())
    }

    pub fn program(&self, program_id: &str) -> Option<&ProgramDefinition> {
        self.programs.get(program_id)
    }

    /// Grace period for a program, falling back to the lifecycle default.
    pub fn grace_period_days(&self, program_id: &str) -> i64 {
        self.program(program_id)
            .and_then(|p| p.grace_period_days)
            .unwrap_or(self.lifecycle.default_grace_period_days)
    }

    /// Config with hardcoded defaults for use in unit tests.
    pub fn default_test() -> Self {
        let programs = [
            ("RX_3M", "Quarterly program", 3u32),
            ("RX_6M", "Semi-annual program", 6),
            ("RX_9M", "Nine-month program", 9),
        ]
        .into_iter()
        .map(|(id, label, months)| {
            (
                id.to_string(),
                ProgramDefinition {
                    program_id: id.into(),
                    label: label.into(),
                    cycle_length_months: months,
                    grace_period_days: None,
                },
            )
        })
        .collect();

        Self {
            programs,
            lifecycle: LifecycleConfig {
                default_grace_period_days: 15,
                renewal_lead_days: 30,
                opening_window_days: 30,
            },
            features: FeatureConfig {
                windows_days: vec![30, 60, 90, 180],
                long_gap_days: 60,
                excluded_statuses: vec!["declined".into(), "failed".into(), "void".into()],
            },
            scoring: ScoringConfig {
                weights: ChurnWeights {
                    base_rate: 0.05,
                    recency_weight: 0.30,
                    recency_horizon_days: 90,
                    revenue_decline_weight: 0.20,
                    long_gap_weight: 0.15,
                    refund_rate_weight: 0.10,
                    engagement_silence_weight: 0.10,
                    engagement_silence_days: 60,
                    prior_churn_weight: 0.10,
                    grace_period_weight: 0.25,
                },
                thresholds: ChurnThresholds {
                    low_risk: 0.20,
                    medium_risk: 0.40,
                    high_risk: 0.60,
                    imminent_churn: 0.85,
                },
                at_risk_threshold: 0.60,
            },
            batch: BatchConfig { shards: 4 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_is_valid() {
        assert!(PipelineConfig::default_test().validate().is_ok());
    }

    #[test]
    fn descending_thresholds_are_rejected() {
        let mut cfg = PipelineConfig::default_test();
        cfg.scoring.thresholds.high_risk = 0.10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_program_uses_default_grace() {
        let cfg = PipelineConfig::default_test();
        assert_eq!(cfg.grace_period_days("NOPE"), 15);
    }
}
