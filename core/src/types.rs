//! Shared primitive types used across the entire pipeline.

use chrono::{DateTime, NaiveDate, Utc};

/// A snapshot date. One snapshot = one logical day of the batch calendar.
/// Facts are visible to a snapshot only when strictly earlier than its
/// midnight (UTC).
pub type SnapshotDate = NaiveDate;

/// A point on the load / event time axis.
pub type Timestamp = DateTime<Utc>;

/// Stable key assigned by the entity resolver to a payment entity.
pub type PaymentKey = String;

/// Stable key assigned by the entity resolver to a provider.
pub type ProviderKey = String;

/// Natural identifier of a subscription program.
pub type ProgramId = String;

/// Monotonic ingestion sequence. Breaks ties between updates carrying the
/// same load timestamp.
pub type LoadSeq = u64;

/// The canonical pipeline run identifier.
pub type RunId = String;

/// Midnight UTC at the start of `date`: the exclusive upper bound of
/// everything a snapshot may read.
pub fn snapshot_boundary(date: SnapshotDate) -> Timestamp {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
