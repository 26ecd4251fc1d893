//! snapshot-runner: batch driver for the churnlens pipeline.
//!
//! Usage:
//!   snapshot-runner --db ledger.db --data-dir ./data --from 2025-01-01 --to 2025-06-30 --step-days 7 --out ./out
//!   snapshot-runner --synthetic 200 --seed 42 --step-days 14 --out ./out
//!
//! CSV inputs are read from `<data-dir>/input/`: payments.csv, providers.csv,
//! program_events.csv, engagement.csv and resolver.csv.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use churnlens_core::{
    calendar::SnapshotCalendar,
    config::PipelineConfig,
    engine::{PipelineEngine, SnapshotSummary},
    error::PipelineError,
    fact::{group_by_load_day, RawPaymentRecord},
    provider::{EngagementActivity, InMemoryEngagementFeed, ProgramEvent, ProviderProfile},
    resolver::{ResolverRow, StaticResolver},
    store::PipelineStore,
    synthetic::SyntheticDataset,
};
use serde::de::DeserializeOwned;
use std::env;
use std::path::Path;

struct Inputs {
    payments:       Vec<RawPaymentRecord>,
    providers:      Vec<ProviderProfile>,
    program_events: Vec<ProgramEvent>,
    engagement:     Vec<EngagementActivity>,
    resolver_rows:  Vec<ResolverRow>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let synthetic = parse_arg(&args, "--synthetic", 0usize);
    let history_days = parse_arg(&args, "--days", 365i64);
    let step_days = parse_arg(&args, "--step-days", 7i64);
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = str_arg(&args, "--data-dir").unwrap_or("./data");
    let out_dir = str_arg(&args, "--out");
    let from = date_arg(&args, "--from")?;
    let to = date_arg(&args, "--to")?;

    println!("churnlens snapshot-runner");
    println!("  db:         {db}");
    println!("  data_dir:   {data_dir}");
    if synthetic > 0 {
        println!("  synthetic:  {synthetic} providers, seed {seed}, {history_days} days");
    }
    println!();

    let config = match PipelineConfig::load(data_dir) {
        Ok(c) => c,
        Err(e) if synthetic > 0 => {
            log::warn!("{e}; using built-in defaults");
            PipelineConfig::default_test()
        }
        Err(e) => return Err(e),
    };

    let history_start = NaiveDate::from_ymd_opt(2024, 1, 1).context("invalid history start")?;
    let inputs = if synthetic > 0 {
        let data = SyntheticDataset::generate(seed, synthetic, history_start, history_days, &config);
        Inputs {
            payments:       data.payments,
            providers:      data.providers,
            program_events: data.program_events,
            engagement:     data.engagement,
            resolver_rows:  data.resolver_rows,
        }
    } else {
        read_inputs(&Path::new(data_dir).join("input"))?
    };

    let store = PipelineStore::open(db)?;
    let run_id = format!("run-{seed}-{}", unix_seconds());
    let mut engine = PipelineEngine::new(
        run_id.clone(),
        config,
        store,
        Box::new(StaticResolver::from_rows(inputs.resolver_rows)),
        Box::new(InMemoryEngagementFeed::new(inputs.engagement)),
    )?;
    engine.set_providers(inputs.providers);
    engine.set_program_events(inputs.program_events);

    // ── Ingest: one batch per load day ──────────────────────────
    let batches = group_by_load_day(inputs.payments);
    let first_day = batches.iter().find_map(|(day, _)| *day);
    let last_day = batches.iter().rev().find_map(|(day, _)| *day);
    let (mut loaded, mut skipped, mut failed) = (0usize, 0usize, 0usize);
    for (day, records) in &batches {
        match engine.ingest_batch(records) {
            Ok(report) if report.skipped => skipped += 1,
            Ok(_) => loaded += 1,
            Err(PipelineError::NoResolvableRecords { batch_id, rejected }) => {
                log::warn!("load day {day:?}: batch {batch_id} failed, {rejected} records to review");
                failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // ── Snapshots ───────────────────────────────────────────────
    let default_from = first_day.map(|d| d + Duration::days(30));
    let (Some(from), Some(to)) = (from.or(default_from), to.or(last_day)) else {
        println!("No payment batches and no --from/--to given; nothing to snapshot.");
        return Ok(());
    };
    let calendar = SnapshotCalendar::new(from, to, step_days);
    let summaries = engine.run_snapshots(&calendar)?;

    if let Some(out) = out_dir {
        for s in &summaries {
            if let Some(date) = s.snapshot_date {
                let path = engine.export_partition(Path::new(out), date)?;
                log::debug!("exported {}", path.display());
            }
        }
    }

    print_summary(&engine, &summaries, loaded, skipped, failed)?;
    Ok(())
}

fn read_inputs(dir: &Path) -> Result<Inputs> {
    Ok(Inputs {
        payments:       read_csv(&dir.join("payments.csv"))?,
        providers:      read_csv_optional(&dir.join("providers.csv"))?,
        program_events: read_csv_optional(&dir.join("program_events.csv"))?,
        engagement:     read_csv_optional(&dir.join("engagement.csv"))?,
        resolver_rows:  read_csv(&dir.join("resolver.csv"))?,
    })
}

fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let rows = reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("Malformed row in {}", path.display()))?;
    log::info!("input: {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

fn read_csv_optional<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if path.exists() {
        read_csv(path)
    } else {
        log::warn!("input: {} not found, continuing without it", path.display());
        Ok(Vec::new())
    }
}

fn print_summary(
    engine: &PipelineEngine,
    summaries: &[SnapshotSummary],
    loaded: usize,
    skipped: usize,
    failed: usize,
) -> Result<()> {
    let store = engine.store();
    println!("=== Ingestion ===");
    println!("  batches loaded:   {loaded}");
    println!("  batches skipped:  {skipped}");
    println!("  batches failed:   {failed}");
    println!("  payment facts:    {}", store.payment_fact_count()?);
    println!("  versions:         {} ({} current)", store.version_count()?, store.current_version_count()?);
    println!("  review queue:     {}", store.review_items()?.len());
    println!();
    println!("=== Snapshots ===");
    println!("  {:<12} {:>6} {:>8} {:>8} {:>8} {:>8}", "date", "rows", "unclass", "grace", "churned", "at_risk");
    for s in summaries {
        let date = s.snapshot_date.map(|d| d.to_string()).unwrap_or_default();
        println!(
            "  {:<12} {:>6} {:>8} {:>8} {:>8} {:>8}",
            date, s.rows, s.unclassified, s.in_grace, s.churned, s.at_risk
        );
    }
    println!();
    println!("  total rows:       {}", store.feature_row_count(None)?);
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn date_arg(args: &[String], flag: &str) -> Result<Option<NaiveDate>> {
    str_arg(args, flag)
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("{flag} expects YYYY-MM-DD, got {s}"))
        })
        .transpose()
}

fn unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
