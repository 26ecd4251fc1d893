//! Pipeline events: the audit trail an operator reads after a batch.
//!
//! RULE: every stage reports what it did through these events; they are
//! appended to `event_log` and never drive control flow.

use crate::types::{RunId, SnapshotDate};
use serde::{Deserialize, Serialize};

/// Every event emitted during a run.
/// Variants are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    // ── Engine events ──────────────────────────────
    RunInitialized {
        run_id: RunId,
    },

    // ── Ingestion and versioning ───────────────────
    BatchLoaded {
        batch_id:     String,
        batch_digest: String,
        accepted:     usize,
        rejected:     usize,
        new_versions: usize,
        late_splits:  usize,
        unchanged:    usize,
        replayed:     usize,
    },
    BatchSkipped {
        batch_digest: String,
    },
    BatchFailed {
        batch_id: String,
        rejected: usize,
    },
    RecordFlagged {
        batch_id:   String,
        payment_id: Option<String>,
        reason:     String,
    },

    // ── Snapshot stages ────────────────────────────
    SnapshotStarted {
        snapshot_date: SnapshotDate,
        providers:     usize,
    },
    SnapshotCompleted {
        snapshot_date: SnapshotDate,
        rows:          usize,
        unclassified:  usize,
        in_grace:      usize,
        churned:       usize,
        at_risk:       usize,
    },
}

impl PipelineEvent {
    /// Stable name for the event_type column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RunInitialized { .. }    => "run_initialized",
            Self::BatchLoaded { .. }       => "batch_loaded",
            Self::BatchSkipped { .. }      => "batch_skipped",
            Self::BatchFailed { .. }       => "batch_failed",
            Self::RecordFlagged { .. }     => "record_flagged",
            Self::SnapshotStarted { .. }   => "snapshot_started",
            Self::SnapshotCompleted { .. } => "snapshot_completed",
        }
    }
}

/// A single row in the event_log table.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id:            Option<i64>,
    pub run_id:        RunId,
    pub snapshot_date: Option<SnapshotDate>,
    pub stage:         String,
    pub event_type:    String,
    pub payload:       String,
}
