use chrono::{TimeZone, Utc};
use churnlens_core::{
    config::PipelineConfig,
    engine::PipelineEngine,
    error::PipelineError,
    fact::RawPaymentRecord,
    resolver::StaticResolver,
    store::PipelineStore,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

fn raw(payment_id: &str, provider_id: &str, total: &str, load_day: u32) -> RawPaymentRecord {
    RawPaymentRecord {
        payment_id:     payment_id.into(),
        order_id:       format!("ORD-{payment_id}"),
        provider_id:    provider_id.into(),
        program_id:     "RX_3M".into(),
        copay_amount:   "20.00".into(),
        total_amount:   total.into(),
        cost_amount:    "60.00".into(),
        status:         "completed".into(),
        is_refund:      "false".into(),
        event_ts:       "2025-01-05 10:00:00".into(),
        load_ts:        format!("2025-01-{load_day:02} 02:00:00"),
        ..Default::default()
    }
}

fn resolver() -> StaticResolver {
    StaticResolver::identity(
        (1..=5).map(|i| format!("PAY-{i}")),
        ["PRV-1".to_string(), "PRV-2".to_string()],
    )
}

fn make_engine(run_id: &str) -> PipelineEngine {
    let mut engine = PipelineEngine::in_memory(run_id, PipelineConfig::default_test()).unwrap();
    engine.set_resolver(Box::new(resolver()));
    engine
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// A re-delivered batch is recognised by its digest and skipped entirely.
#[test]
fn identical_batch_is_skipped() {
    let mut engine = make_engine("ingest-skip");
    let batch = vec![raw("PAY-1", "PRV-1", "100.00", 6), raw("PAY-2", "PRV-1", "80.00", 6)];

    let first = engine.ingest_batch(&batch).unwrap();
    let second = engine.ingest_batch(&batch).unwrap();

    assert!(!first.skipped);
    assert_eq!(first.accepted, 2);
    assert_eq!(first.merge.opened, 2);
    assert!(second.skipped);
    assert_eq!(engine.store().batch_count().unwrap(), 1);
    assert_eq!(engine.store().version_count().unwrap(), 2);
    assert_eq!(engine.store().payment_fact_count().unwrap(), 2);
}

/// The same payload in a new batch adds a fact but no version.
#[test]
fn unchanged_payload_in_new_batch_adds_no_version() {
    let mut engine = make_engine("ingest-unchanged");
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 6)]).unwrap();
    let report = engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 7)]).unwrap();

    assert_eq!(report.merge.unchanged, 1);
    assert_eq!(report.merge.new_versions(), 0);
    assert_eq!(engine.store().version_count().unwrap(), 1);
    assert_eq!(engine.store().payment_fact_count().unwrap(), 2);
}

/// A correction closes the current version and opens a new one; exactly
/// one version stays current.
#[test]
fn correction_appends_version() {
    let mut engine = make_engine("ingest-correction");
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 6)]).unwrap();
    let report = engine.ingest_batch(&[raw("PAY-1", "PRV-1", "150.00", 9)]).unwrap();

    assert_eq!(report.merge.appended, 1);
    assert_eq!(engine.store().version_count().unwrap(), 2);
    assert_eq!(engine.store().current_version_count().unwrap(), 1);

    let probe = Utc.with_ymd_and_hms(2025, 1, 7, 0, 0, 0).unwrap();
    let v = engine.versions().as_of("PAY-1", probe).unwrap().unwrap();
    assert_eq!(v.payload.total_amount, Some(100.0));
}

/// A correction delivered after a later one re-slices history.
#[test]
fn late_correction_counts_as_late_split() {
    let mut engine = make_engine("ingest-late");
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 6)]).unwrap();
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "300.00", 20)]).unwrap();
    let report = engine.ingest_batch(&[raw("PAY-1", "PRV-1", "150.00", 12)]).unwrap();

    assert_eq!(report.merge.split, 1);
    assert_eq!(engine.store().version_count().unwrap(), 3);
    assert!(engine.versions().check_all().is_ok());
}

/// Re-delivering the losing row of a same-timestamp tie in a later file
/// does not override the correction that won the tie.
#[test]
fn replayed_record_does_not_override_correction() {
    let mut engine = make_engine("ingest-replay");
    engine
        .ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 10), raw("PAY-1", "PRV-1", "120.00", 10)])
        .unwrap();
    let report = engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 10)]).unwrap();

    assert!(!report.skipped);
    assert_eq!(report.merge.replayed, 1);
    assert!(report.merge.touched.is_empty());
    let current = engine.versions().chain("PAY-1").unwrap().current().unwrap();
    assert_eq!(current.payload.total_amount, Some(120.0));
    assert_eq!(engine.store().version_count().unwrap(), 1);
}

/// Bad numerics degrade to null; the record itself is kept.
#[test]
fn malformed_values_are_kept_as_nulls() {
    let mut engine = make_engine("ingest-malformed");
    let mut record = raw("PAY-1", "PRV-1", "$1,250.50", 6);
    record.copay_amount = "N/A".into();

    let report = engine.ingest_batch(&[record]).unwrap();
    assert_eq!(report.accepted, 1);

    let chain = engine.versions().chain("PAY-1").unwrap();
    let payload = &chain.current().unwrap().payload;
    assert_eq!(payload.copay_amount, None);
    assert_eq!(payload.total_amount, Some(1250.5));
}

/// Records the resolver cannot place go to the review queue; the rest of
/// the batch loads.
#[test]
fn unresolved_records_go_to_review_queue() {
    let mut engine = make_engine("ingest-review");
    let batch = vec![
        raw("PAY-1", "PRV-1", "100.00", 6),
        raw("PAY-2", "PRV-404", "80.00", 6),
        raw("PAY-999", "PRV-1", "80.00", 6),
    ];

    let report = engine.ingest_batch(&batch).unwrap();
    assert_eq!((report.accepted, report.rejected), (1, 2));

    let items = engine.store().review_items().unwrap();
    let reasons: Vec<&str> = items.iter().map(|i| i.reason.as_str()).collect();
    assert_eq!(reasons, vec!["unresolved_provider", "unresolved_payment"]);
    assert_eq!(items[0].payment_id.as_deref(), Some("PAY-2"));
    assert!(engine.versions().chain("PAY-2").is_none());
}

/// A non-empty batch with nothing resolvable fails as a whole and is not
/// recorded as loaded.
#[test]
fn batch_without_resolvable_records_fails() {
    let mut engine = make_engine("ingest-fail");
    let batch = vec![raw("", "PRV-1", "100.00", 6), raw("  ", "PRV-1", "80.00", 6)];

    let err = engine.ingest_batch(&batch).unwrap_err();
    assert!(matches!(err, PipelineError::NoResolvableRecords { rejected: 2, .. }));
    assert_eq!(engine.store().review_items().unwrap().len(), 2);
    assert_eq!(engine.store().version_count().unwrap(), 0);

    // A FAILED digest is not a successful load; re-delivery is evaluated again.
    assert!(engine.ingest_batch(&batch).is_err());
}

/// The event log records what each batch did.
#[test]
fn ingestion_is_audited() {
    let mut engine = make_engine("ingest-audit");
    let batch = vec![raw("PAY-1", "PRV-1", "100.00", 6), raw("PAY-2", "PRV-404", "80.00", 6)];
    engine.ingest_batch(&batch).unwrap();
    engine.ingest_batch(&batch).unwrap();

    let types: Vec<String> = engine
        .store()
        .events_for_run("ingest-audit")
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec!["run_initialized", "record_flagged", "batch_loaded", "batch_skipped"]
    );
}

/// A reopened database resumes with the same version history and still
/// recognises batches it has already loaded.
#[test]
fn reopened_store_restores_versions() {
    let path = std::env::temp_dir().join(format!("churnlens-restore-{}.db", std::process::id()));
    let path_str = path.to_string_lossy().to_string();
    let _ = std::fs::remove_file(&path);
    let batch = vec![raw("PAY-1", "PRV-1", "100.00", 6), raw("PAY-2", "PRV-2", "80.00", 6)];

    {
        let store = PipelineStore::open(&path_str).unwrap();
        let mut engine = PipelineEngine::new(
            "restore-1".into(),
            PipelineConfig::default_test(),
            store,
            Box::new(resolver()),
            Box::new(churnlens_core::provider::InMemoryEngagementFeed::default()),
        )
        .unwrap();
        engine.ingest_batch(&batch).unwrap();
        engine.ingest_batch(&[raw("PAY-1", "PRV-1", "150.00", 9)]).unwrap();
    }

    let store = PipelineStore::open(&path_str).unwrap();
    let mut engine = PipelineEngine::new(
        "restore-2".into(),
        PipelineConfig::default_test(),
        store,
        Box::new(resolver()),
        Box::new(churnlens_core::provider::InMemoryEngagementFeed::default()),
    )
    .unwrap();

    assert_eq!(engine.versions().len(), 2);
    assert_eq!(engine.versions().chain("PAY-1").unwrap().versions().len(), 2);
    assert!(engine.ingest_batch(&batch).unwrap().skipped);

    // The reopened history still re-slices around a late arrival.
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "100.00", 20)]).unwrap();
    engine.ingest_batch(&[raw("PAY-1", "PRV-1", "130.00", 15)]).unwrap();
    let chain = engine.versions().chain("PAY-1").unwrap();
    let totals: Vec<Option<f64>> = chain.versions().iter().map(|v| v.payload.total_amount).collect();
    assert_eq!(totals, vec![Some(100.0), Some(150.0), Some(130.0), Some(100.0)]);

    drop(engine);
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
    }
}
