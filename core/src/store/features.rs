use super::{parse_date, PipelineStore};
use crate::{
    error::PipelineResult,
    training::{FeatureRow, StoredFeatureRow},
    types::SnapshotDate,
};
use rusqlite::params;

impl PipelineStore {
    // ── Training table ──────────────────────────────────────────

    /// Replace the partition of `snapshot_date` with `rows`, keyed by
    /// (snapshot_date, provider_id). A provider that no longer gets a row on
    /// re-run loses its stale one in the same transaction.
    pub fn upsert_feature_rows(&self, snapshot_date: SnapshotDate, rows: &[FeatureRow]) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            "DELETE FROM feature_row WHERE snapshot_date = ?1",
            params![snapshot_date.to_string()],
        )?;
        {
            let mut stmt = self.conn.prepare_cached(
                "INSERT INTO feature_row (
                    snapshot_date, provider_id, cycle_end_date,
                    current_subscription_status, churn_label, churn_probability, features_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(snapshot_date, provider_id) DO UPDATE SET
                    cycle_end_date              = excluded.cycle_end_date,
                    current_subscription_status = excluded.current_subscription_status,
                    churn_label                 = excluded.churn_label,
                    churn_probability           = excluded.churn_probability,
                    features_json               = excluded.features_json",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.snapshot_date.to_string(),
                    row.provider_id,
                    row.cycle_end_date.to_string(),
                    row.status,
                    row.churn_label as i32,
                    row.churn_probability,
                    serde_json::to_string(&row.to_json())?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One snapshot partition, ordered by provider.
    pub fn feature_rows_for_snapshot(&self, snapshot_date: SnapshotDate) -> PipelineResult<Vec<StoredFeatureRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider_id, snapshot_date, cycle_end_date,
                    current_subscription_status, churn_label, churn_probability, features_json
             FROM feature_row WHERE snapshot_date = ?1
             ORDER BY provider_id ASC",
        )?;
        let rows = stmt
            .query_map(params![snapshot_date.to_string()], |row| {
                let snapshot: String = row.get(1)?;
                let cycle_end: Option<String> = row.get(2)?;
                Ok(StoredFeatureRow {
                    provider_id: row.get(0)?,
                    snapshot_date: parse_date(1, &snapshot)?,
                    cycle_end_date: cycle_end.map(|s| parse_date(2, &s)).transpose()?,
                    status: row.get(3)?,
                    churn_label: row.get::<_, i32>(4)? != 0,
                    churn_probability: row.get(5)?,
                    features_json: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn feature_row_count(&self, snapshot_date: Option<SnapshotDate>) -> PipelineResult<usize> {
        let n: i64 = match snapshot_date {
            Some(d) => self.conn.query_row(
                "SELECT COUNT(*) FROM feature_row WHERE snapshot_date = ?1",
                params![d.to_string()],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM feature_row", [], |row| row.get(0))?,
        };
        Ok(n as usize)
    }
}
