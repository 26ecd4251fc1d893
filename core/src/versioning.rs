//! Temporal versioning engine: SCD2 history of payment financial attributes.
//!
//! Every payment entity owns one `VersionChain`: a list of versions sorted by
//! `valid_from` whose `[valid_from, valid_to)` intervals partition the load
//! time axis from the first load onwards. The open version (`valid_to =
//! None`) is the current one; "current" is derived, never stored.
//!
//! RULES:
//!   - Updates are applied in `(load_ts, load_seq)` order.
//!   - An unchanged content hash is a no-op; an update whose load timestamp
//!     and content were already applied is a replay and is dropped.
//!   - A late update rebuilds the chain from its sorted update log, giving
//!     the history the sorted stream would have produced.
//!   - One entity's updates are applied by exactly one thread.

use crate::{
    error::{PipelineError, PipelineResult},
    fact::FinancialPayload,
    resolver::ResolvedFact,
    types::{LoadSeq, PaymentKey, ProviderKey, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

// ── Versions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialVersion {
    pub valid_from:   Timestamp,
    /// `None` is the open-ended sentinel.
    pub valid_to:     Option<Timestamp>,
    pub content_hash: String,
    pub load_seq:     LoadSeq,
    pub payload:      FinancialPayload,
}

impl FinancialVersion {
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        self.valid_from <= t && self.valid_to.map_or(true, |end| t < end)
    }
}

/// One tracked-attribute update for a payment entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionUpdate {
    pub payment_key:  PaymentKey,
    pub provider_key: ProviderKey,
    pub load_ts:      Timestamp,
    pub load_seq:     LoadSeq,
    pub content_hash: String,
    pub payload:      FinancialPayload,
}

impl VersionUpdate {
    pub fn from_resolved(resolved: &ResolvedFact) -> Self {
        let payload = resolved.fact.payload();
        Self {
            payment_key:  resolved.payment_key.clone(),
            provider_key: resolved.provider_key.clone(),
            load_ts:      resolved.fact.load_ts,
            load_seq:     resolved.fact.load_seq,
            content_hash: payload.content_hash(),
            payload,
        }
    }

    fn order_key(&self) -> (Timestamp, LoadSeq) {
        (self.load_ts, self.load_seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// First version of a new entity.
    Opened,
    /// Current version closed, new current version opened.
    Appended,
    /// Late update landed inside a closed interval and split it.
    Split,
    /// Late update earlier than every known version.
    Backfilled,
    /// Same `valid_from` as an existing version; the later ingestion won.
    Replaced,
    /// Content hash unchanged, or an earlier ingestion lost a timestamp tie.
    Unchanged,
    /// Same load timestamp and content as an update already applied.
    Replayed,
}

// ── Chain ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChain {
    pub payment_key:  PaymentKey,
    /// Provider of the latest update in `(load_ts, load_seq)` order.
    pub provider_key: ProviderKey,
    /// Every applied update, sorted by `(load_ts, load_seq)`. The versions
    /// are a function of this log alone.
    log:              Vec<VersionUpdate>,
    versions:         Vec<FinancialVersion>,
}

impl VersionChain {
    pub fn new(payment_key: PaymentKey, provider_key: ProviderKey) -> Self {
        Self {
            payment_key,
            provider_key,
            log: Vec::new(),
            versions: Vec::new(),
        }
    }

    pub fn versions(&self) -> &[FinancialVersion] {
        &self.versions
    }

    /// Updates applied so far, in `(load_ts, load_seq)` order.
    pub fn updates(&self) -> &[VersionUpdate] {
        &self.log
    }

    pub fn current(&self) -> Option<&FinancialVersion> {
        self.versions.last().filter(|v| v.is_current())
    }

    pub fn first_seen(&self) -> Option<Timestamp> {
        self.versions.first().map(|v| v.valid_from)
    }

    /// The version whose interval contains `t`, or `None` when `t` precedes
    /// the first version. Binary search over `valid_from`.
    pub fn as_of(&self, t: Timestamp) -> Option<&FinancialVersion> {
        let idx = self.versions.partition_point(|v| v.valid_from <= t);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    /// The version known just before `boundary`: what a snapshot taken at
    /// `boundary` is allowed to see.
    pub fn visible_before(&self, boundary: Timestamp) -> Option<&FinancialVersion> {
        let idx = self.versions.partition_point(|v| v.valid_from < boundary);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }

    /// Whether an update with the same load timestamp and content was
    /// already applied: a re-delivered record, whatever sequence it got.
    pub fn is_replay(&self, update: &VersionUpdate) -> bool {
        self.log
            .iter()
            .any(|u| u.load_ts == update.load_ts && u.content_hash == update.content_hash)
    }

    /// Apply one update at its load timestamp.
    ///
    /// An update behind the latest applied one rebuilds the chain from the
    /// sorted log, so the history never depends on arrival order.
    pub fn apply(&mut self, update: &VersionUpdate) -> MergeOutcome {
        if self.is_replay(update) {
            return MergeOutcome::Replayed;
        }

        let late = self.log.last().is_some_and(|last| update.order_key() < last.order_key());
        let pos = self.log.partition_point(|u| u.order_key() <= update.order_key());
        self.log.insert(pos, update.clone());
        if let Some(last) = self.log.last() {
            self.provider_key = last.provider_key.clone();
        }

        if !late {
            return self.step(update);
        }

        let before = std::mem::take(&mut self.versions);
        let log = std::mem::take(&mut self.log);
        for u in &log {
            self.step(u);
        }
        self.log = log;

        let t = update.load_ts;
        if before == self.versions {
            MergeOutcome::Unchanged
        } else if before.first().is_some_and(|first| t < first.valid_from) {
            MergeOutcome::Backfilled
        } else if before.iter().any(|v| v.valid_from == t) {
            MergeOutcome::Replaced
        } else {
            MergeOutcome::Split
        }
    }

    /// Apply an update no earlier than every version: close/open at the tail.
    fn step(&mut self, update: &VersionUpdate) -> MergeOutcome {
        let fresh = FinancialVersion {
            valid_from:   update.load_ts,
            valid_to:     None,
            content_hash: update.content_hash.clone(),
            load_seq:     update.load_seq,
            payload:      update.payload.clone(),
        };

        let Some(i) = self.versions.len().checked_sub(1) else {
            self.versions.push(fresh);
            return MergeOutcome::Opened;
        };
        let current = &mut self.versions[i];

        if current.content_hash == update.content_hash {
            return MergeOutcome::Unchanged;
        }

        // Same load timestamp: the later sequence wins.
        if current.valid_from == update.load_ts {
            *current = fresh;
            self.coalesce_with_previous(i);
            return MergeOutcome::Replaced;
        }

        current.valid_to = Some(update.load_ts);
        self.versions.push(fresh);
        MergeOutcome::Appended
    }

    /// Fold version `i` into its predecessor when both carry the same content.
    fn coalesce_with_previous(&mut self, i: usize) {
        if i > 0 && self.versions[i - 1].content_hash == self.versions[i].content_hash {
            let removed = self.versions.remove(i);
            self.versions[i - 1].valid_to = removed.valid_to;
        }
    }

    /// Sorted, contiguous, non-empty intervals; exactly one open version, last.
    pub fn check_partition(&self) -> PipelineResult<()> {
        let broken = |detail: String| PipelineError::BrokenChain {
            payment_key: self.payment_key.clone(),
            detail,
        };
        let Some(last) = self.versions.last() else {
            return Err(broken("empty chain".into()));
        };
        if !last.is_current() {
            return Err(broken("last version is closed".into()));
        }
        for pair in self.versions.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            match a.valid_to {
                Some(end) if end == b.valid_from && a.valid_from < end => {}
                Some(end) => {
                    return Err(broken(format!(
                        "interval [{}, {end}) does not meet next start {}",
                        a.valid_from, b.valid_from
                    )))
                }
                None => return Err(broken(format!("open version at {} is not last", a.valid_from))),
            }
        }
        Ok(())
    }
}

// ── Store of chains ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub opened:     usize,
    pub appended:   usize,
    pub split:      usize,
    pub backfilled: usize,
    pub replaced:   usize,
    pub unchanged:  usize,
    pub replayed:   usize,
    /// Entities whose chain changed and must be persisted.
    pub touched:    BTreeSet<PaymentKey>,
}

impl MergeReport {
    fn record(&mut self, key: &str, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Opened     => self.opened += 1,
            MergeOutcome::Appended   => self.appended += 1,
            MergeOutcome::Split      => self.split += 1,
            MergeOutcome::Backfilled => self.backfilled += 1,
            MergeOutcome::Replaced   => self.replaced += 1,
            MergeOutcome::Unchanged  => self.unchanged += 1,
            MergeOutcome::Replayed   => self.replayed += 1,
        }
        if !matches!(outcome, MergeOutcome::Unchanged | MergeOutcome::Replayed) {
            self.touched.insert(key.to_string());
        }
    }

    fn absorb(&mut self, other: MergeReport) {
        self.opened += other.opened;
        self.appended += other.appended;
        self.split += other.split;
        self.backfilled += other.backfilled;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.replayed += other.replayed;
        self.touched.extend(other.touched);
    }

    pub fn new_versions(&self) -> usize {
        self.opened + self.appended + self.split + self.backfilled
    }
}

/// All version chains, keyed by payment key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionStore {
    chains: BTreeMap<PaymentKey, VersionChain>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn chain(&self, key: &str) -> Option<&VersionChain> {
        self.chains.get(key)
    }

    pub fn chains(&self) -> impl Iterator<Item = &VersionChain> {
        self.chains.values()
    }

    /// As-of lookup. Unknown entity is an error; a probe before the first
    /// version is `Ok(None)`.
    pub fn as_of(&self, key: &str, t: Timestamp) -> PipelineResult<Option<&FinancialVersion>> {
        self.chains
            .get(key)
            .map(|c| c.as_of(t))
            .ok_or_else(|| PipelineError::EntityNotFound { key: key.to_string() })
    }

    pub fn visible_before(
        &self,
        key: &str,
        boundary: Timestamp,
    ) -> PipelineResult<Option<&FinancialVersion>> {
        self.chains
            .get(key)
            .map(|c| c.visible_before(boundary))
            .ok_or_else(|| PipelineError::EntityNotFound { key: key.to_string() })
    }

    /// Chains grouped by their provider.
    pub fn by_provider(&self) -> BTreeMap<&str, Vec<&VersionChain>> {
        let mut grouped: BTreeMap<&str, Vec<&VersionChain>> = BTreeMap::new();
        for chain in self.chains.values() {
            grouped.entry(chain.provider_key.as_str()).or_default().push(chain);
        }
        grouped
    }

    /// Merge a batch of updates. Updates are sharded by entity key and each
    /// shard runs on its own scoped thread; an entity lives in exactly one
    /// shard, so its close/open pairs never interleave.
    pub fn merge_batch(&mut self, mut updates: Vec<VersionUpdate>, shards: usize) -> MergeReport {
        let shards = shards.max(1);
        updates.sort_by(|a, b| {
            a.order_key()
                .cmp(&b.order_key())
                .then_with(|| a.payment_key.cmp(&b.payment_key))
        });

        let mut work: Vec<(BTreeMap<PaymentKey, VersionChain>, Vec<VersionUpdate>)> =
            (0..shards).map(|_| (BTreeMap::new(), Vec::new())).collect();

        for update in updates {
            let shard = &mut work[shard_of(&update.payment_key, shards)];
            if !shard.0.contains_key(&update.payment_key) {
                let chain = self.chains.remove(&update.payment_key).unwrap_or_else(|| {
                    VersionChain::new(update.payment_key.clone(), update.provider_key.clone())
                });
                shard.0.insert(update.payment_key.clone(), chain);
            }
            shard.1.push(update);
        }

        let results: Vec<(BTreeMap<PaymentKey, VersionChain>, MergeReport)> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = work
                    .into_iter()
                    .map(|(mut chains, updates)| {
                        scope.spawn(move || {
                            let mut report = MergeReport::default();
                            for update in &updates {
                                if let Some(chain) = chains.get_mut(&update.payment_key) {
                                    let outcome = chain.apply(update);
                                    report.record(&update.payment_key, outcome);
                                }
                            }
                            (chains, report)
                        })
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

        let mut report = MergeReport::default();
        for (chains, shard_report) in results {
            self.chains.extend(chains);
            report.absorb(shard_report);
        }
        report
    }

    /// Check the partition invariant on every chain.
    pub fn check_all(&self) -> PipelineResult<()> {
        self.chains.values().try_for_each(VersionChain::check_partition)
    }
}

fn shard_of(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
