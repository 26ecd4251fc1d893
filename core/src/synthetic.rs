//! Deterministic synthetic dataset: providers, program events, payment
//! staging rows and engagement activity for demos and tests.
//!
//! RULE: the same (seed, provider count, window) always yields the same
//! dataset, record for record.
//!
//! The generated payment stream deliberately carries the messiness the
//! pipeline must absorb: corrections re-delivered under the same payment id,
//! late arrivals, refunds, malformed amounts, missing keys and providers the
//! resolver does not know.

use crate::{
    config::PipelineConfig,
    cycle::add_months,
    fact::RawPaymentRecord,
    provider::{EngagementActivity, EngagementChannel, ProgramEvent, ProgramEventKind, ProviderProfile},
    resolver::{ResolverRow, StaticResolver},
    rng::{DataRng, RngBank, StreamSlot},
    types::{SnapshotDate, Timestamp},
};
use chrono::{DateTime, Duration, Utc};

const LOCATIONS: &[(&str, &str)] = &[
    ("TX", "Austin"),
    ("TX", "Houston"),
    ("FL", "Tampa"),
    ("OH", "Columbus"),
    ("CA", "Fresno"),
    ("NY", "Albany"),
    ("GA", "Savannah"),
    ("AZ", "Mesa"),
];
const CHANNELS: &[&str] = &["field_sales", "referral", "web", "conference"];
const PAYERS: &[&str] = &["medicare", "medicaid", "commercial", "self_pay"];
const METHODS: &[&str] = &["card", "ach", "check"];
const CRM_ACTIVITIES: &[&str] = &["email_opened", "meeting", "webinar", "portal_login"];
const CALL_ACTIVITIES: &[&str] = &["support_call", "billing_call", "renewal_call"];

/// Natural provider id the resolver never learns about.
pub const UNKNOWN_PROVIDER: &str = "P99999";

#[derive(Debug, Clone, Default)]
pub struct SyntheticDataset {
    pub providers:      Vec<ProviderProfile>,
    pub program_events: Vec<ProgramEvent>,
    pub payments:       Vec<RawPaymentRecord>,
    pub engagement:     Vec<EngagementActivity>,
    pub resolver_rows:  Vec<ResolverRow>,
}

struct Streams {
    providers:   DataRng,
    programs:    DataRng,
    payments:    DataRng,
    corrections: DataRng,
    engagement:  DataRng,
    noise:       DataRng,
}

impl SyntheticDataset {
    /// Generate `provider_count` providers whose history runs from `start`
    /// for `days` days. Programs come from `config`.
    pub fn generate(
        seed: u64,
        provider_count: usize,
        start: SnapshotDate,
        days: i64,
        config: &PipelineConfig,
    ) -> Self {
        let bank = RngBank::new(seed);
        let mut rng = Streams {
            providers:   bank.for_stream(StreamSlot::Providers),
            programs:    bank.for_stream(StreamSlot::Programs),
            payments:    bank.for_stream(StreamSlot::Payments),
            corrections: bank.for_stream(StreamSlot::Corrections),
            engagement:  bank.for_stream(StreamSlot::Engagement),
            noise:       bank.for_stream(StreamSlot::Noise),
        };

        let mut programs: Vec<(&String, u32, i64)> = config
            .programs
            .values()
            .map(|p| (&p.program_id, p.cycle_length_months, config.grace_period_days(&p.program_id)))
            .collect();
        programs.sort();

        let horizon = start + Duration::days(days);
        let mut data = Self::default();
        let mut payment_no = 0u32;

        for i in 1..=provider_count {
            let natural_id = format!("P{i:05}");
            let key = format!("prv-{i:05}");
            data.resolver_rows.push(ResolverRow {
                kind:       "provider".into(),
                natural_id: natural_id.clone(),
                stable_key: key.clone(),
            });

            let onboarding = start + Duration::days(rng.providers.between(0, days / 3));
            let (state, city) = rng.providers.pick(LOCATIONS).copied().unwrap_or(("TX", "Austin"));
            data.providers.push(ProviderProfile {
                provider_id:        key.clone(),
                npi:                Some(format!("{}", 1_000_000_000 + rng.providers.below(900_000_000))),
                state:              Some(state.into()),
                city:               Some(city.into()),
                onboarding_date:    Some(onboarding),
                onboarding_channel: rng.providers.pick(CHANNELS).map(|c| c.to_string()),
            });

            let Some(&(program_id, months, grace)) = rng.programs.pick(&programs) else {
                continue;
            };
            let mut cycle_start = onboarding + Duration::days(rng.programs.between(0, 14));
            let mut active_until = horizon;
            data.program_events.push(ProgramEvent {
                provider_id: key.clone(),
                program_id:  program_id.clone(),
                kind:        ProgramEventKind::Enrolled,
                event_date:  cycle_start,
            });

            while cycle_start < horizon {
                let mut cycle_end = add_months(cycle_start, months);

                for m in 0..months {
                    let day = add_months(cycle_start, m) + Duration::days(rng.payments.between(0, 5));
                    if day >= horizon {
                        break;
                    }
                    let program = (m == 0).then_some(program_id.as_str());
                    data.emit_payment(&mut rng, &mut payment_no, &natural_id, program, day);
                }

                if rng.programs.chance(0.04) {
                    let cancelled_on = cycle_start + Duration::days(rng.programs.between(10, 60));
                    data.program_event(&key, program_id, ProgramEventKind::Cancelled, cancelled_on);
                    active_until = cancelled_on;
                    break;
                }
                if rng.programs.chance(0.06) {
                    let paused_on = cycle_start + Duration::days(rng.programs.between(20, 40));
                    let paused_for = rng.programs.between(10, 30);
                    data.program_event(&key, program_id, ProgramEventKind::Paused, paused_on);
                    data.program_event(
                        &key,
                        program_id,
                        ProgramEventKind::Resumed,
                        paused_on + Duration::days(paused_for),
                    );
                    cycle_end = cycle_end + Duration::days(paused_for);
                }

                let roll = rng.programs.next_f64();
                cycle_start = if roll < 0.20 {
                    active_until = cycle_end + Duration::days(30);
                    break;
                } else if roll < 0.30 {
                    // Lapsed past grace, then came back.
                    cycle_end + Duration::days(rng.programs.between(grace + 5, grace + 60))
                } else if roll < 0.40 {
                    cycle_end - Duration::days(rng.programs.between(5, 20))
                } else {
                    cycle_end + Duration::days(rng.programs.between(0, 5))
                };
            }

            data.emit_engagement(&mut rng.engagement, &key, onboarding, active_until.min(horizon));
        }

        // Unresolvable provider: lands in the review queue.
        if provider_count > 0 {
            data.emit_payment(&mut rng, &mut payment_no, UNKNOWN_PROVIDER, None, start + Duration::days(days / 2));
        }

        data.program_events.sort_by(|a, b| {
            (a.provider_id.as_str(), a.event_date).cmp(&(b.provider_id.as_str(), b.event_date))
        });
        log::info!(
            "synthetic: seed={seed} providers={} payments={} program_events={} engagement={}",
            data.providers.len(),
            data.payments.len(),
            data.program_events.len(),
            data.engagement.len()
        );
        data
    }

    pub fn resolver(&self) -> StaticResolver {
        StaticResolver::from_rows(self.resolver_rows.iter().cloned())
    }

    fn program_event(&mut self, key: &str, program_id: &str, kind: ProgramEventKind, event_date: SnapshotDate) {
        self.program_events.push(ProgramEvent {
            provider_id: key.to_string(),
            program_id:  program_id.to_string(),
            kind,
            event_date,
        });
    }

    fn emit_payment(
        &mut self,
        rng: &mut Streams,
        payment_no: &mut u32,
        provider_natural_id: &str,
        program_id: Option<&str>,
        day: SnapshotDate,
    ) {
        *payment_no += 1;
        let n = *payment_no;
        let payment_id = format!("PAY{n:07}");
        let order_id = format!("ORD{n:07}");

        let event_ts = at(day, rng.payments.between(8, 18) as u32, rng.payments.between(0, 59) as u32);
        let mut load_ts = at(day + Duration::days(1), 2, 0);
        if rng.payments.chance(0.05) {
            load_ts = load_ts + Duration::days(rng.payments.between(2, 10));
        }

        let total = rng.payments.amount(40.0, 400.0);
        let copay = (total * (0.1 + 0.3 * rng.payments.next_f64()) * 100.0).round() / 100.0;
        let cost = (total * (0.55 + 0.2 * rng.payments.next_f64()) * 100.0).round() / 100.0;
        let status = match rng.payments.below(100) {
            0..=2 => "declined",
            3..=4 => "pending",
            _ => "completed",
        };

        let mut record = RawPaymentRecord {
            payment_id:       payment_id.clone(),
            order_id:         order_id.clone(),
            provider_id:      provider_natural_id.to_string(),
            program_id:       program_id.unwrap_or_default().to_string(),
            copay_amount:     format!("{copay:.2}"),
            insurance_amount: format!("{:.2}", total - copay),
            total_amount:     format!("{total:.2}"),
            cost_amount:      format!("{cost:.2}"),
            profit_amount:    format!("{:.2}", total - cost),
            payer:            rng.payments.pick(PAYERS).map(|s| s.to_string()).unwrap_or_default(),
            payment_method:   rng.payments.pick(METHODS).map(|s| s.to_string()).unwrap_or_default(),
            status:           status.into(),
            is_refund:        "false".into(),
            event_ts:         fmt_ts(event_ts),
            load_ts:          fmt_ts(load_ts),
        };

        // Malformed values survive as nulls; a missing key is rejected.
        if rng.noise.chance(0.02) {
            record.copay_amount = "N/A".into();
        }
        if rng.noise.chance(0.02) {
            record.total_amount = format!("${total:.2}");
        }
        let missing_key = rng.noise.chance(0.01);
        if missing_key {
            record.payment_id = String::new();
        } else {
            self.resolver_rows.push(ResolverRow {
                kind:       "payment".into(),
                natural_id: payment_id.clone(),
                stable_key: format!("pay-{n:07}"),
            });
        }

        // Correction re-delivered later under the same payment id.
        if !missing_key && rng.corrections.chance(0.06) {
            let mut corrected = record.clone();
            let adjusted = (total * (0.9 + 0.2 * rng.corrections.next_f64()) * 100.0).round() / 100.0;
            corrected.total_amount = format!("{adjusted:.2}");
            corrected.profit_amount = format!("{:.2}", adjusted - cost);
            corrected.load_ts = fmt_ts(load_ts + Duration::days(rng.corrections.between(1, 20)));
            self.payments.push(record.clone());
            self.payments.push(corrected);
        } else {
            self.payments.push(record.clone());
        }

        if !missing_key && status == "completed" && rng.corrections.chance(0.03) {
            *payment_no += 1;
            let r = *payment_no;
            let refund_day = day + Duration::days(rng.corrections.between(3, 20));
            let amount = (total * (0.2 + 0.8 * rng.corrections.next_f64()) * 100.0).round() / 100.0;
            self.resolver_rows.push(ResolverRow {
                kind:       "payment".into(),
                natural_id: format!("PAY{r:07}"),
                stable_key: format!("pay-{r:07}"),
            });
            self.payments.push(RawPaymentRecord {
                payment_id:    format!("PAY{r:07}"),
                order_id,
                provider_id:   provider_natural_id.to_string(),
                total_amount:  format!("{amount:.2}"),
                status:        "completed".into(),
                is_refund:     "true".into(),
                payer:         record.payer.clone(),
                event_ts:      fmt_ts(at(refund_day, 12, 0)),
                load_ts:       fmt_ts(at(refund_day + Duration::days(1), 2, 0)),
                ..Default::default()
            });
        }
    }

    fn emit_engagement(&mut self, rng: &mut DataRng, key: &str, from: SnapshotDate, until: SnapshotDate) {
        let mut week = from;
        while week < until {
            for channel in EngagementChannel::ALL {
                let (p, names) = match channel {
                    EngagementChannel::Crm        => (0.25, CRM_ACTIVITIES),
                    EngagementChannel::CallCenter => (0.10, CALL_ACTIVITIES),
                };
                if rng.chance(p) {
                    let day = week + Duration::days(rng.between(0, 6));
                    self.engagement.push(EngagementActivity {
                        provider_id: key.to_string(),
                        channel,
                        activity:    rng.pick(names).map(|s| s.to_string()).unwrap_or_default(),
                        occurred_at: at(day, rng.between(9, 17) as u32, 0),
                    });
                }
            }
            week = week + Duration::days(7);
        }
    }
}

fn at(day: SnapshotDate, hour: u32, minute: u32) -> Timestamp {
    day.and_hms_opt(hour % 24, minute % 60, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn fmt_ts(ts: Timestamp) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::EntityResolver;
    use chrono::NaiveDate;

    fn generate(seed: u64) -> SyntheticDataset {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        SyntheticDataset::generate(seed, 25, start, 365, &PipelineConfig::default_test())
    }

    #[test]
    fn same_seed_same_dataset() {
        let a = generate(7);
        let b = generate(7);
        assert_eq!(a.payments.len(), b.payments.len());
        for (x, y) in a.payments.iter().zip(&b.payments) {
            assert_eq!(x.payment_id, y.payment_id);
            assert_eq!(x.total_amount, y.total_amount);
            assert_eq!(x.load_ts, y.load_ts);
        }
        assert_eq!(a.program_events, b.program_events);
        assert_eq!(a.engagement, b.engagement);
    }

    #[test]
    fn every_provider_enrolls_once_up_front() {
        let data = generate(11);
        assert_eq!(data.providers.len(), 25);
        for p in &data.providers {
            let first = data
                .program_events
                .iter()
                .find(|e| e.provider_id == p.provider_id)
                .map(|e| e.kind);
            assert_eq!(first, Some(ProgramEventKind::Enrolled));
        }
    }

    #[test]
    fn unknown_provider_is_not_resolvable() {
        let data = generate(3);
        let resolver = data.resolver();
        assert!(resolver.resolve_provider(UNKNOWN_PROVIDER).is_none());
        assert!(resolver.resolve_provider("P00001").is_some());
    }
}
