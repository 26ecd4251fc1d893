//! The pipeline engine: ingests payment batches and materializes snapshots.
//!
//! EXECUTION ORDER (never reordered):
//!   Per batch:
//!     1. Batch digest check     (already loaded → skip)
//!     2. Normalization          (malformed values → None)
//!     3. Entity resolution      (unresolved → review queue)
//!     4. Temporal versioning    (sharded merge)
//!     5. Persist                (one transaction)
//!   Per snapshot date D:
//!     1. Cycle derivation       (starts and program events before D)
//!     2. Lifecycle classification
//!     3. Feature aggregation    (facts strictly before D)
//!     4. Churn scoring
//!     5. Training row build + upsert
//!
//! RULES:
//!   - Snapshot stages never read anything at or after D's boundary.
//!   - Snapshot stages are pure over the version store; nothing is cached
//!     between snapshots.
//!   - All state changes are recorded in the event log.

use crate::{
    calendar::SnapshotCalendar,
    config::PipelineConfig,
    cycle::{derive_cycles, CycleOrigin, CycleStart},
    error::{PipelineError, PipelineResult},
    event::{EventLogEntry, PipelineEvent},
    fact::{normalize, parse_text, RawPaymentRecord},
    features::{aggregate, FeatureSet},
    lifecycle::{classify, LifecycleSnapshot, SubscriptionStatus},
    provider::{EngagementFeed, InMemoryEngagementFeed, ProgramEvent, ProgramEventKind, ProviderProfile},
    resolver::{resolve, EntityResolver, ResolvedFact, StaticResolver},
    scoring::{score, ChurnScore},
    store::{BatchRecord, PipelineStore, ReviewItem},
    training::{build_row, write_partition_csv, FeatureRow},
    types::{snapshot_boundary, LoadSeq, ProviderKey, RunId, SnapshotDate},
    versioning::{MergeReport, VersionChain, VersionStore, VersionUpdate},
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Outcome of one `ingest_batch` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub batch_id:     Option<String>,
    pub batch_digest: String,
    pub skipped:      bool,
    pub record_count: usize,
    pub accepted:     usize,
    pub rejected:     usize,
    pub merge:        MergeReport,
}

/// Everything computed for one provider at one snapshot date.
#[derive(Debug, Clone)]
pub struct ProviderEvaluation {
    pub snapshot: LifecycleSnapshot,
    pub features: FeatureSet,
    pub score:    ChurnScore,
    pub row:      FeatureRow,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotSummary {
    pub snapshot_date: Option<SnapshotDate>,
    pub rows:          usize,
    pub unclassified:  usize,
    pub in_grace:      usize,
    pub churned:       usize,
    pub at_risk:       usize,
}

pub struct PipelineEngine {
    pub run_id:     RunId,
    config:         PipelineConfig,
    store:          PipelineStore,
    versions:       VersionStore,
    resolver:       Box<dyn EntityResolver>,
    engagement:     Box<dyn EngagementFeed>,
    providers:      BTreeMap<ProviderKey, ProviderProfile>,
    program_events: BTreeMap<ProviderKey, Vec<ProgramEvent>>,
    next_seq:       LoadSeq,
}

impl PipelineEngine {
    /// Wire an engine over `store`. Migrations are applied and the version
    /// store is rebuilt from the ledger, so a reopened database resumes
    /// where the last run stopped.
    pub fn new(
        run_id: RunId,
        config: PipelineConfig,
        store: PipelineStore,
        resolver: Box<dyn EntityResolver>,
        engagement: Box<dyn EngagementFeed>,
    ) -> PipelineResult<Self> {
        config.validate().map_err(PipelineError::InvalidConfig)?;
        store.migrate()?;
        store.insert_run(&run_id, env!("CARGO_PKG_VERSION"))?;

        let versions = store.load_version_store(config.batch.shards)?;
        let next_seq = store.max_load_seq()? + 1;
        if !versions.is_empty() {
            log::info!(
                "engine: restored {} payment chains, next load_seq={next_seq}",
                versions.len()
            );
        }

        let engine = Self {
            run_id: run_id.clone(),
            config,
            store,
            versions,
            resolver,
            engagement,
            providers: BTreeMap::new(),
            program_events: BTreeMap::new(),
            next_seq,
        };
        engine.emit(None, "engine", &PipelineEvent::RunInitialized { run_id })?;
        Ok(engine)
    }

    /// In-memory engine with an empty resolver and engagement feed.
    pub fn in_memory(run_id: &str, config: PipelineConfig) -> PipelineResult<Self> {
        Self::new(
            run_id.to_string(),
            config,
            PipelineStore::in_memory()?,
            Box::new(StaticResolver::default()),
            Box::new(InMemoryEngagementFeed::default()),
        )
    }

    pub fn set_resolver(&mut self, resolver: Box<dyn EntityResolver>) {
        self.resolver = resolver;
    }

    pub fn set_engagement(&mut self, engagement: Box<dyn EngagementFeed>) {
        self.engagement = engagement;
    }

    pub fn set_providers(&mut self, providers: impl IntoIterator<Item = ProviderProfile>) {
        self.providers = providers
            .into_iter()
            .map(|p| (p.provider_id.clone(), p))
            .collect();
    }

    pub fn set_program_events(&mut self, events: impl IntoIterator<Item = ProgramEvent>) {
        self.program_events.clear();
        for e in events {
            self.program_events.entry(e.provider_id.clone()).or_default().push(e);
        }
        for list in self.program_events.values_mut() {
            list.sort_by_key(|e| e.event_date);
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &PipelineStore {
        &self.store
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    // ── Ingestion ──────────────────────────────────────────────

    /// Ingest one delivered batch of staging rows.
    ///
    /// A batch whose digest already loaded successfully is skipped. A
    /// non-empty batch in which no record resolves fails with
    /// `NoResolvableRecords`; its rejects still reach the review queue.
    pub fn ingest_batch(&mut self, records: &[RawPaymentRecord]) -> PipelineResult<IngestReport> {
        let digest = batch_digest(records)?;
        if self.store.batch_loaded(&digest)? {
            log::info!("ingest: batch {} already loaded, skipping", &digest[..12]);
            self.emit(None, "ingest", &PipelineEvent::BatchSkipped { batch_digest: digest.clone() })?;
            return Ok(IngestReport {
                batch_digest: digest,
                skipped: true,
                record_count: records.len(),
                ..Default::default()
            });
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut resolved: Vec<ResolvedFact> = Vec::with_capacity(records.len());
        let mut flagged: Vec<ReviewItem> = Vec::new();

        for raw in records {
            let seq = self.next_seq;
            self.next_seq += 1;
            let outcome = normalize(raw, seq)
                .map_err(|reason| (serde_json::to_string(raw), reason))
                .and_then(|fact| {
                    resolve(&*self.resolver, fact)
                        .map_err(|(fact, reason)| (serde_json::to_string(&fact), reason))
                });
            match outcome {
                Ok(r) => resolved.push(r),
                Err((json, reason)) => flagged.push(ReviewItem {
                    batch_id:    batch_id.clone(),
                    payment_id:  parse_text(&raw.payment_id),
                    provider_id: parse_text(&raw.provider_id),
                    reason:      reason.as_str().to_string(),
                    record_json: json?,
                }),
            }
        }

        let mut batch = BatchRecord {
            batch_digest: digest.clone(),
            batch_id:     batch_id.clone(),
            record_count: records.len(),
            accepted:     resolved.len(),
            rejected:     flagged.len(),
            status:       "SUCCESS".into(),
        };

        if resolved.is_empty() && !records.is_empty() {
            batch.status = "FAILED".into();
            self.store.write_batch(&batch, &[], &[], &flagged)?;
            self.emit_flags(&flagged)?;
            self.emit(None, "ingest", &PipelineEvent::BatchFailed {
                batch_id: batch_id.clone(),
                rejected: flagged.len(),
            })?;
            log::warn!("ingest: batch {batch_id} has no resolvable records ({} rejected)", flagged.len());
            return Err(PipelineError::NoResolvableRecords { batch_id, rejected: flagged.len() });
        }

        // Merge on a staged copy; it replaces the live store only once the
        // batch has been committed.
        let updates: Vec<VersionUpdate> = resolved.iter().map(VersionUpdate::from_resolved).collect();
        let mut staged = self.versions.clone();
        let merge = staged.merge_batch(updates, self.config.batch.shards);
        let touched: Vec<&VersionChain> = merge.touched.iter().filter_map(|k| staged.chain(k)).collect();
        self.store.write_batch(&batch, &resolved, &touched, &flagged)?;
        self.versions = staged;

        self.emit_flags(&flagged)?;
        self.emit(None, "ingest", &PipelineEvent::BatchLoaded {
            batch_id:     batch_id.clone(),
            batch_digest: digest.clone(),
            accepted:     batch.accepted,
            rejected:     batch.rejected,
            new_versions: merge.new_versions(),
            late_splits:  merge.split + merge.backfilled,
            unchanged:    merge.unchanged,
            replayed:     merge.replayed,
        })?;
        log::info!(
            "ingest: batch {batch_id} accepted={} rejected={} new_versions={} late={} unchanged={} replayed={}",
            batch.accepted,
            batch.rejected,
            merge.new_versions(),
            merge.split + merge.backfilled,
            merge.unchanged,
            merge.replayed
        );

        Ok(IngestReport {
            batch_id: Some(batch_id),
            batch_digest: digest,
            skipped: false,
            record_count: records.len(),
            accepted: batch.accepted,
            rejected: batch.rejected,
            merge,
        })
    }

    // ── Snapshots ──────────────────────────────────────────────

    /// Classify, aggregate and score one provider at `date`.
    /// `None` when the provider has no cycle visible before `date`.
    pub fn evaluate_provider(&self, provider_id: &str, date: SnapshotDate) -> PipelineResult<Option<ProviderEvaluation>> {
        let by_provider = self.versions.by_provider();
        self.context(date, &by_provider).evaluate(provider_id)
    }

    /// Materialize the training rows for one snapshot date. Re-running a
    /// date overwrites its rows.
    pub fn run_snapshot(&mut self, date: SnapshotDate) -> PipelineResult<SnapshotSummary> {
        let by_provider = self.versions.by_provider();
        let provider_ids: Vec<&str> = self
            .providers
            .keys()
            .chain(self.program_events.keys())
            .map(String::as_str)
            .chain(by_provider.keys().copied())
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .collect();

        self.emit(Some(date), "snapshot", &PipelineEvent::SnapshotStarted {
            snapshot_date: date,
            providers:     provider_ids.len(),
        })?;

        let ctx = self.context(date, &by_provider);
        let shards = self.config.batch.shards.max(1);
        let chunk = provider_ids.len().div_ceil(shards).max(1);

        let results: Vec<PipelineResult<Vec<Option<ProviderEvaluation>>>> = std::thread::scope(|scope| {
            let ctx = &ctx;
            let handles: Vec<_> = provider_ids
                .chunks(chunk)
                .map(|ids| {
                    scope.spawn(move || ids.iter().map(|id| ctx.evaluate(id)).collect::<PipelineResult<Vec<_>>>())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut summary = SnapshotSummary { snapshot_date: Some(date), ..Default::default() };
        let mut rows = Vec::with_capacity(provider_ids.len());
        for shard in results {
            for evaluation in shard? {
                let Some(e) = evaluation else {
                    summary.unclassified += 1;
                    continue;
                };
                if e.snapshot.is_in_grace_period {
                    summary.in_grace += 1;
                }
                if e.snapshot.status == SubscriptionStatus::Churned {
                    summary.churned += 1;
                }
                if e.snapshot.is_at_risk {
                    summary.at_risk += 1;
                }
                rows.push(e.row);
            }
        }
        summary.rows = rows.len();

        self.store.upsert_feature_rows(date, &rows)?;
        self.emit(Some(date), "snapshot", &PipelineEvent::SnapshotCompleted {
            snapshot_date: date,
            rows:          summary.rows,
            unclassified:  summary.unclassified,
            in_grace:      summary.in_grace,
            churned:       summary.churned,
            at_risk:       summary.at_risk,
        })?;
        log::info!(
            "snapshot={date} rows={} unclassified={} in_grace={} churned={} at_risk={}",
            summary.rows,
            summary.unclassified,
            summary.in_grace,
            summary.churned,
            summary.at_risk
        );
        Ok(summary)
    }

    pub fn run_snapshots(&mut self, calendar: &SnapshotCalendar) -> PipelineResult<Vec<SnapshotSummary>> {
        calendar.iter().map(|date| self.run_snapshot(date)).collect()
    }

    /// Export one stored partition as CSV under `out_dir`.
    pub fn export_partition(&self, out_dir: &Path, date: SnapshotDate) -> PipelineResult<PathBuf> {
        let rows = self.store.feature_rows_for_snapshot(date)?;
        write_partition_csv(out_dir, date, &rows)
    }

    // ── Internals ──────────────────────────────────────────────

    fn context<'a>(
        &'a self,
        date: SnapshotDate,
        by_provider: &'a BTreeMap<&'a str, Vec<&'a VersionChain>>,
    ) -> SnapshotContext<'a> {
        SnapshotContext {
            date,
            config: &self.config,
            by_provider,
            engagement: &*self.engagement,
            providers: &self.providers,
            program_events: &self.program_events,
        }
    }

    fn emit(&self, date: Option<SnapshotDate>, stage: &str, event: &PipelineEvent) -> PipelineResult<()> {
        let entry = EventLogEntry {
            id:            None,
            run_id:        self.run_id.clone(),
            snapshot_date: date,
            stage:         stage.to_string(),
            event_type:    event.type_name().to_string(),
            payload:       serde_json::to_string(event)?,
        };
        self.store.append_event(&entry)
    }

    fn emit_flags(&self, flagged: &[ReviewItem]) -> PipelineResult<()> {
        for item in flagged {
            log::debug!(
                "ingest: flagged {} for review: {}",
                item.payment_id.as_deref().unwrap_or("<no id>"),
                item.reason
            );
            self.emit(None, "ingest", &PipelineEvent::RecordFlagged {
                batch_id:   item.batch_id.clone(),
                payment_id: item.payment_id.clone(),
                reason:     item.reason.clone(),
            })?;
        }
        Ok(())
    }
}

/// Read-only view shared by the snapshot workers.
struct SnapshotContext<'a> {
    date:           SnapshotDate,
    config:         &'a PipelineConfig,
    by_provider:    &'a BTreeMap<&'a str, Vec<&'a VersionChain>>,
    engagement:     &'a dyn EngagementFeed,
    providers:      &'a BTreeMap<ProviderKey, ProviderProfile>,
    program_events: &'a BTreeMap<ProviderKey, Vec<ProgramEvent>>,
}

impl SnapshotContext<'_> {
    fn evaluate(&self, provider_id: &str) -> PipelineResult<Option<ProviderEvaluation>> {
        let events: &[ProgramEvent] = self.program_events.get(provider_id).map_or(&[], Vec::as_slice);
        let chains: &[&VersionChain] = self.by_provider.get(provider_id).map_or(&[], Vec::as_slice);

        let starts = self.cycle_starts(chains, events);
        let cycles = derive_cycles(provider_id, &starts, events, self.date, self.config);
        let Some(mut snapshot) = classify(&cycles, events, self.date, self.config) else {
            return Ok(None);
        };

        let boundary = snapshot_boundary(self.date);
        let activities = self.engagement.activities_before(provider_id, boundary);
        let features = aggregate(
            provider_id,
            chains,
            &activities,
            Some(&snapshot.cycle),
            self.date,
            &self.config.features,
        );
        let score = score(&features, &snapshot, &self.config.scoring);
        snapshot.apply_score(score.probability, self.config);

        let row = build_row(
            self.providers.get(provider_id),
            self.config.program(&snapshot.cycle.program_id),
            &snapshot,
            &score,
            &features,
        )?;
        Ok(Some(ProviderEvaluation { snapshot, features, score, row }))
    }

    /// Enrollments plus subscription payments visible before the snapshot.
    fn cycle_starts(&self, chains: &[&VersionChain], events: &[ProgramEvent]) -> Vec<CycleStart> {
        let boundary = snapshot_boundary(self.date);
        let excluded = &self.config.features.excluded_statuses;

        let enrollments = events
            .iter()
            .filter(|e| e.kind == ProgramEventKind::Enrolled)
            .map(|e| CycleStart {
                date:       e.event_date,
                origin:     CycleOrigin::Enrollment,
                program_id: e.program_id.clone(),
            });

        let payments = chains.iter().filter_map(|chain| {
            let p = &chain.visible_before(boundary)?.payload;
            let program_id = p.program_id.clone()?;
            let counted = !p.refund()
                && p.event_ts < boundary
                && !p.status.as_ref().is_some_and(|s| excluded.contains(s));
            counted.then(|| CycleStart {
                date:       p.event_ts.date_naive(),
                origin:     CycleOrigin::Payment,
                program_id,
            })
        });

        enrollments.chain(payments).collect()
    }
}

/// SHA-256 over the batch's records in delivery order.
fn batch_digest(records: &[RawPaymentRecord]) -> PipelineResult<String> {
    let mut hasher = Sha256::new();
    for r in records {
        hasher.update(serde_json::to_vec(r)?);
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}
