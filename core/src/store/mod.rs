//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! The engine calls store methods; stages never execute SQL directly.
//!
//! Timestamps are stored as RFC 3339 UTC text with microsecond precision,
//! so lexical order equals time order.

use crate::{
    error::PipelineResult,
    event::EventLogEntry,
    types::{SnapshotDate, Timestamp},
};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection};

mod features;
mod versions;

pub struct PipelineStore {
    conn: Connection,
}

/// One row of the ingestion batch log.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch_digest: String,
    pub batch_id:     String,
    pub record_count: usize,
    pub accepted:     usize,
    pub rejected:     usize,
    /// `SUCCESS` or `FAILED`.
    pub status:       String,
}

/// A record excluded from derived facts, waiting for an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub batch_id:    String,
    pub payment_id:  Option<String>,
    pub provider_id: Option<String>,
    pub reason:      String,
    pub record_json: String,
}

impl PipelineStore {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL only matters for real files.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> PipelineResult<Self> {
        let conn = Connection::open(":memory:")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> PipelineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_ledger.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_training_table.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    pub fn insert_run(&self, run_id: &str, version: &str) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO run (run_id, version, started_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO NOTHING",
            params![run_id, version, ts_text(Utc::now())],
        )?;
        Ok(())
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (run_id, snapshot_date, stage, event_type, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.run_id,
                entry.snapshot_date.map(|d| d.to_string()),
                entry.stage,
                entry.event_type,
                entry.payload,
            ],
        )?;
        Ok(())
    }

    pub fn events_for_run(&self, run_id: &str) -> PipelineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, snapshot_date, stage, event_type, payload
             FROM event_log WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![run_id], |row| {
                let snapshot_date: Option<String> = row.get(2)?;
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    run_id: row.get(1)?,
                    snapshot_date: snapshot_date
                        .map(|s| parse_date(2, &s))
                        .transpose()?,
                    stage: row.get(3)?,
                    event_type: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// ── Column codecs ────────────────────────────────────────────

pub(crate) fn ts_text(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_date(idx: usize, text: &str) -> rusqlite::Result<SnapshotDate> {
    text.parse::<SnapshotDate>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
