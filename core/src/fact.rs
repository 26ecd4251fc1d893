//! Payment records: raw staging rows, their normalized immutable facts,
//! and the tracked financial payload the versioning engine historizes.
//!
//! RULE: a malformed value degrades one field to `None`, never the record.
//! Only a record that cannot be keyed or placed on the time axis is rejected.

use crate::types::{LoadSeq, Timestamp};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ── Raw staging row ──────────────────────────────────────────────────────────

/// One payment row exactly as delivered by normalized staging.
/// Every column is text; typing happens in `normalize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPaymentRecord {
    pub payment_id:       String,
    #[serde(default)]
    pub order_id:         String,
    #[serde(default)]
    pub provider_id:      String,
    #[serde(default)]
    pub program_id:       String,
    #[serde(default)]
    pub copay_amount:     String,
    #[serde(default)]
    pub insurance_amount: String,
    #[serde(default)]
    pub total_amount:     String,
    #[serde(default)]
    pub cost_amount:      String,
    #[serde(default)]
    pub profit_amount:    String,
    #[serde(default)]
    pub payer:            String,
    #[serde(default)]
    pub payment_method:   String,
    #[serde(default)]
    pub status:           String,
    #[serde(default)]
    pub is_refund:        String,
    #[serde(default)]
    pub event_ts:         String,
    #[serde(default)]
    pub load_ts:          String,
}

// ── Normalized fact ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFact {
    pub payment_id:       String,
    pub order_id:         Option<String>,
    pub provider_id:      Option<String>,
    pub program_id:       Option<String>,
    pub copay_amount:     Option<f64>,
    pub insurance_amount: Option<f64>,
    pub total_amount:     Option<f64>,
    pub cost_amount:      Option<f64>,
    pub profit_amount:    Option<f64>,
    pub payer:            Option<String>,
    pub payment_method:   Option<String>,
    pub status:           Option<String>,
    pub is_refund:        Option<bool>,
    pub event_ts:         Timestamp,
    pub load_ts:          Timestamp,
    pub load_seq:         LoadSeq,
}

impl PaymentFact {
    /// The mutable attribute subset tracked by the versioning engine.
    pub fn payload(&self) -> FinancialPayload {
        FinancialPayload {
            order_id:         self.order_id.clone(),
            program_id:       self.program_id.clone(),
            copay_amount:     self.copay_amount,
            insurance_amount: self.insurance_amount,
            total_amount:     self.total_amount,
            cost_amount:      self.cost_amount,
            profit_amount:    self.profit_amount,
            payer:            self.payer.clone(),
            payment_method:   self.payment_method.clone(),
            status:           self.status.clone(),
            is_refund:        self.is_refund,
            event_ts:         self.event_ts,
        }
    }
}

/// Why a raw record could not become a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingKey,
    MissingTimestamp { field: String },
    UnresolvedPayment,
    UnresolvedProvider,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingKey            => "missing_key",
            Self::MissingTimestamp { .. } => "missing_timestamp",
            Self::UnresolvedPayment     => "unresolved_payment",
            Self::UnresolvedProvider    => "unresolved_provider",
        }
    }
}

/// Type a raw staging row. `seq` is the ingestion sequence of the row.
pub fn normalize(raw: &RawPaymentRecord, seq: LoadSeq) -> Result<PaymentFact, RejectReason> {
    let payment_id = raw.payment_id.trim();
    if payment_id.is_empty() {
        return Err(RejectReason::MissingKey);
    }

    let event_ts = parse_timestamp(&raw.event_ts).ok_or_else(|| RejectReason::MissingTimestamp {
        field: "event_ts".into(),
    })?;
    let load_ts = parse_timestamp(&raw.load_ts).ok_or_else(|| RejectReason::MissingTimestamp {
        field: "load_ts".into(),
    })?;

    Ok(PaymentFact {
        payment_id:       payment_id.to_string(),
        order_id:         parse_text(&raw.order_id),
        provider_id:      parse_text(&raw.provider_id),
        program_id:       parse_text(&raw.program_id),
        copay_amount:     parse_amount(&raw.copay_amount),
        insurance_amount: parse_amount(&raw.insurance_amount),
        total_amount:     parse_amount(&raw.total_amount),
        cost_amount:      parse_amount(&raw.cost_amount),
        profit_amount:    parse_amount(&raw.profit_amount),
        payer:            parse_text(&raw.payer),
        payment_method:   parse_text(&raw.payment_method),
        status:           parse_text(&raw.status).map(|s| s.to_ascii_lowercase()),
        is_refund:        parse_flag(&raw.is_refund),
        event_ts,
        load_ts,
        load_seq: seq,
    })
}

// ── Field parsers ────────────────────────────────────────────────────────────

pub fn parse_text(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

/// Parse a money amount. Accepts a leading `$` and thousands separators.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "t"  => Some(true),
        "false" | "0" | "no" | "n" | "f"  => Some(false),
        _ => None,
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` (UTC) or a bare date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<Timestamp> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(v) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(v, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(v, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Split staging rows into daily batches by load date, ascending. Rows
/// whose load timestamp does not parse form a leading `None` batch; they are
/// rejected at normalization like any other malformed row.
pub fn group_by_load_day(
    records: impl IntoIterator<Item = RawPaymentRecord>,
) -> Vec<(Option<NaiveDate>, Vec<RawPaymentRecord>)> {
    let mut days: BTreeMap<Option<NaiveDate>, Vec<RawPaymentRecord>> = BTreeMap::new();
    for record in records {
        let day = parse_timestamp(&record.load_ts).map(|ts| ts.date_naive());
        days.entry(day).or_default().push(record);
    }
    days.into_iter().collect()
}

// ── Tracked payload ──────────────────────────────────────────────────────────

/// The historized attributes of one payment entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialPayload {
    pub order_id:         Option<String>,
    pub program_id:       Option<String>,
    pub copay_amount:     Option<f64>,
    pub insurance_amount: Option<f64>,
    pub total_amount:     Option<f64>,
    pub cost_amount:      Option<f64>,
    pub profit_amount:    Option<f64>,
    pub payer:            Option<String>,
    pub payment_method:   Option<String>,
    pub status:           Option<String>,
    pub is_refund:        Option<bool>,
    pub event_ts:         Timestamp,
}

impl FinancialPayload {
    /// SHA-256 over a canonical rendering of every tracked field.
    /// Equal payloads always hash equal; field order is fixed here.
    pub fn content_hash(&self) -> String {
        fn text(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or("\u{2400}")
        }
        fn num(v: Option<f64>) -> String {
            v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "\u{2400}".into())
        }

        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            text(&self.order_id),
            text(&self.program_id),
            num(self.copay_amount),
            num(self.insurance_amount),
            num(self.total_amount),
            num(self.cost_amount),
            num(self.profit_amount),
            text(&self.payer),
            text(&self.payment_method),
            text(&self.status),
            self.is_refund.map(|b| if b { "1" } else { "0" }).unwrap_or("\u{2400}"),
            self.event_ts.timestamp_micros(),
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Profit as delivered, or total minus cost when only those are known.
    pub fn effective_profit(&self) -> Option<f64> {
        self.profit_amount.or(match (self.total_amount, self.cost_amount) {
            (Some(total), Some(cost)) => Some(total - cost),
            _ => None,
        })
    }

    pub fn refund(&self) -> bool {
        self.is_refund.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawPaymentRecord {
        RawPaymentRecord {
            payment_id:       "PAY-1".into(),
            order_id:         "ORD-1".into(),
            provider_id:      "PRV-1".into(),
            total_amount:     "$1,250.50".into(),
            copay_amount:     "abc".into(),
            is_refund:        "N".into(),
            event_ts:         "2025-01-03 10:00:00".into(),
            load_ts:          "2025-01-04T02:00:00Z".into(),
            ..Default::default()
        }
    }

    #[test]
    fn malformed_numeric_becomes_null_and_record_survives() {
        let fact = normalize(&raw(), 1).unwrap();
        assert_eq!(fact.total_amount, Some(1250.50));
        assert_eq!(fact.copay_amount, None);
        assert_eq!(fact.is_refund, Some(false));
    }

    #[test]
    fn missing_payment_id_is_rejected() {
        let mut r = raw();
        r.payment_id = "  ".into();
        assert_eq!(normalize(&r, 1), Err(RejectReason::MissingKey));
    }

    #[test]
    fn unparsable_load_timestamp_is_rejected() {
        let mut r = raw();
        r.load_ts = "yesterday".into();
        assert!(matches!(
            normalize(&r, 1),
            Err(RejectReason::MissingTimestamp { .. })
        ));
    }

    #[test]
    fn hash_changes_only_with_payload() {
        let a = normalize(&raw(), 1).unwrap().payload();
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());
        b.total_amount = Some(99.0);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
