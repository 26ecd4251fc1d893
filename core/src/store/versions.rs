use super::{ts_text, BatchRecord, PipelineStore, ReviewItem};
use crate::{
    error::PipelineResult,
    fact::PaymentFact,
    resolver::ResolvedFact,
    versioning::{VersionChain, VersionStore, VersionUpdate},
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

impl PipelineStore {
    // ── Ingestion batch log ─────────────────────────────────────

    /// Whether a batch with this digest already loaded successfully.
    pub fn batch_loaded(&self, batch_digest: &str) -> PipelineResult<bool> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM ingestion_batch WHERE batch_digest = ?1",
                params![batch_digest],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some("SUCCESS"))
    }

    /// Record a batch outcome. A FAILED digest may later be overwritten.
    pub fn record_batch(&self, batch: &BatchRecord) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO ingestion_batch (
                batch_digest, batch_id, record_count, accepted, rejected, status, loaded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(batch_digest) DO UPDATE SET
                batch_id     = excluded.batch_id,
                record_count = excluded.record_count,
                accepted     = excluded.accepted,
                rejected     = excluded.rejected,
                status       = excluded.status,
                loaded_at    = excluded.loaded_at",
            params![
                batch.batch_digest,
                batch.batch_id,
                batch.record_count as i64,
                batch.accepted as i64,
                batch.rejected as i64,
                batch.status,
                ts_text(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn batch_count(&self) -> PipelineResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ingestion_batch", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Persist one batch atomically: facts, the rewritten version chains,
    /// review items and the batch log row commit together or not at all.
    pub fn write_batch(
        &self,
        batch: &BatchRecord,
        facts: &[ResolvedFact],
        chains: &[&VersionChain],
        flagged: &[ReviewItem],
    ) -> PipelineResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for resolved in facts {
            self.insert_payment_fact(&batch.batch_id, resolved)?;
        }
        for chain in chains {
            self.replace_chain(chain)?;
        }
        for item in flagged {
            self.flag_for_review(item)?;
        }
        self.record_batch(batch)?;
        tx.commit()?;
        Ok(())
    }

    // ── Payment facts (append-only) ──────────────────────────────

    pub fn insert_payment_fact(&self, batch_id: &str, resolved: &ResolvedFact) -> PipelineResult<()> {
        let fact = &resolved.fact;
        self.conn.execute(
            "INSERT INTO payment_fact (
                payment_key, load_ts, load_seq, provider_key, event_ts, batch_id, fact_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(payment_key, load_ts, load_seq) DO NOTHING",
            params![
                resolved.payment_key,
                ts_text(fact.load_ts),
                fact.load_seq as i64,
                resolved.provider_key,
                ts_text(fact.event_ts),
                batch_id,
                serde_json::to_string(fact)?,
            ],
        )?;
        Ok(())
    }

    pub fn payment_fact_count(&self) -> PipelineResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM payment_fact", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Highest load sequence ever persisted, 0 on an empty ledger.
    pub fn max_load_seq(&self) -> PipelineResult<u64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(load_seq) FROM payment_fact", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    // ── Financial versions ─────────────────────────────────────

    /// Rewrite the stored intervals of one payment entity.
    pub fn replace_chain(&self, chain: &VersionChain) -> PipelineResult<()> {
        self.conn.execute(
            "DELETE FROM financial_version WHERE payment_key = ?1",
            params![chain.payment_key],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO financial_version (
                payment_key, provider_key, valid_from, valid_to,
                content_hash, load_seq, payload_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for v in chain.versions() {
            stmt.execute(params![
                chain.payment_key,
                chain.provider_key,
                ts_text(v.valid_from),
                v.valid_to.map(ts_text),
                v.content_hash,
                v.load_seq as i64,
                serde_json::to_string(&v.payload)?,
            ])?;
        }
        Ok(())
    }

    pub fn version_count(&self) -> PipelineResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM financial_version", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn current_version_count(&self) -> PipelineResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM financial_version WHERE is_current = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Rebuild the in-memory version store by replaying every stored fact.
    /// `financial_version` is the materialized result; the facts are the
    /// source of truth, so late arrivals re-slice the same way after a
    /// reopen.
    pub fn load_version_store(&self, shards: usize) -> PipelineResult<VersionStore> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_key, provider_key, fact_json
             FROM payment_fact
             ORDER BY payment_key, load_ts, load_seq",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut updates = Vec::with_capacity(rows.len());
        for (payment_key, provider_key, json) in rows {
            let fact: PaymentFact = serde_json::from_str(&json)?;
            let resolved = ResolvedFact { payment_key, provider_key, fact };
            updates.push(VersionUpdate::from_resolved(&resolved));
        }

        let mut store = VersionStore::new();
        store.merge_batch(updates, shards);
        store.check_all()?;
        Ok(store)
    }

    // ── Review queue ───────────────────────────────────────────

    pub fn flag_for_review(&self, item: &ReviewItem) -> PipelineResult<()> {
        self.conn.execute(
            "INSERT INTO review_queue (batch_id, payment_id, provider_id, reason, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![item.batch_id, item.payment_id, item.provider_id, item.reason, item.record_json],
        )?;
        Ok(())
    }

    pub fn review_items(&self) -> PipelineResult<Vec<ReviewItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, payment_id, provider_id, reason, record_json
             FROM review_queue ORDER BY id ASC",
        )?;
        let items = stmt
            .query_map([], |row| {
                Ok(ReviewItem {
                    batch_id: row.get(0)?,
                    payment_id: row.get(1)?,
                    provider_id: row.get(2)?,
                    reason: row.get(3)?,
                    record_json: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}
