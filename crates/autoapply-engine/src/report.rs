//! End-of-run artifacts: `final_report.json`, a markdown brief, and a parquet export
//! of the cycle history with a sha256 manifest. Also the audit view used by the CLI.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use autoapply_core::{ApplicationRecord, CycleStats, Outcome};
use autoapply_storage::{sha256_hex, write_atomic, FinalReport};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;

pub const FINAL_REPORT_JSON: &str = "final_report.json";
pub const FINAL_REPORT_MD: &str = "final_report.md";

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes everything under `<reports_dir>/<run_id>/` and returns that directory.
pub async fn write_final_report(reports_dir: &Path, report: &FinalReport, history: &[CycleStats]) -> Result<PathBuf> {
    let run_dir = reports_dir.join(&report.run_id);
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing final report")?;
    write_atomic(&run_dir.join(FINAL_REPORT_JSON), &json)
        .await
        .context("writing final_report.json")?;

    write_atomic(&run_dir.join(FINAL_REPORT_MD), render_brief(report, history).as_bytes())
        .await
        .context("writing final_report.md")?;

    export_cycle_history(&run_dir, history).await?;
    Ok(run_dir)
}

pub fn render_brief(report: &FinalReport, history: &[CycleStats]) -> String {
    let totals = &report.totals;
    let mut out = format!(
        "# AutoApply Final Report\n\n- Run ID: `{}`\n- Generated: {}\n- Cycles: {}\n- Postings seen: {}\n- Postings scored: {}\n- Applications: {} ({} succeeded, {} failed)\n- Success rate: {:.1}%\n- Duplicates skipped: {}\n- Source failures: {}\n- Scorer fallbacks: {}\n- Fingerprints on record: {}\n",
        report.run_id,
        report.generated_at.to_rfc3339(),
        report.total_cycles,
        totals.postings_seen,
        totals.postings_scored,
        totals.postings_applied,
        totals.successes,
        totals.failures,
        report.success_rate,
        totals.duplicates_skipped,
        totals.source_failures,
        totals.scorer_fallbacks,
        report.applied_fingerprints,
    );

    if !history.is_empty() {
        out.push_str("\n## Cycles\n\n| cycle | started | seen | scored | applied | ok | failed | dup |\n|---|---|---|---|---|---|---|---|\n");
        for cycle in history {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
                cycle.cycle_number,
                cycle.started_at.format("%Y-%m-%d %H:%M:%S"),
                cycle.postings_seen,
                cycle.postings_scored,
                cycle.postings_applied,
                cycle.successes,
                cycle.failures,
                cycle.duplicates_skipped,
            ));
        }
    }
    out
}

async fn export_cycle_history(run_dir: &Path, history: &[CycleStats]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let cycles_path = snapshot_dir.join("cycles.parquet");
    write_cycles_parquet(&cycles_path, history)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("cycles", run_dir, &cycles_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

pub fn write_cycles_parquet(path: &Path, history: &[CycleStats]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("cycle_number", DataType::UInt64, false),
        ArrowField::new("started_at", DataType::Utf8, false),
        ArrowField::new("ended_at", DataType::Utf8, false),
        ArrowField::new("duration_secs", DataType::Float64, false),
        ArrowField::new("postings_seen", DataType::UInt64, false),
        ArrowField::new("postings_scored", DataType::UInt64, false),
        ArrowField::new("postings_applied", DataType::UInt64, false),
        ArrowField::new("successes", DataType::UInt64, false),
        ArrowField::new("failures", DataType::UInt64, false),
        ArrowField::new("duplicates_skipped", DataType::UInt64, false),
        ArrowField::new("source_failures", DataType::UInt64, false),
        ArrowField::new("scorer_fallbacks", DataType::UInt64, false),
    ]));

    let counter = |f: fn(&CycleStats) -> u64| UInt64Array::from(history.iter().map(f).collect::<Vec<_>>());
    let started = StringArray::from(
        history
            .iter()
            .map(|c| Some(c.started_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let ended = StringArray::from(
        history
            .iter()
            .map(|c| Some(c.ended_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let durations = Float64Array::from(history.iter().map(CycleStats::duration_secs).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(counter(|c| c.cycle_number)),
            Arc::new(started),
            Arc::new(ended),
            Arc::new(durations),
            Arc::new(counter(|c| c.postings_seen)),
            Arc::new(counter(|c| c.postings_scored)),
            Arc::new(counter(|c| c.postings_applied)),
            Arc::new(counter(|c| c.successes)),
            Arc::new(counter(|c| c.failures)),
            Arc::new(counter(|c| c.duplicates_skipped)),
            Arc::new(counter(|c| c.source_failures)),
            Arc::new(counter(|c| c.scorer_fallbacks)),
        ],
    )
    .context("building cycles record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Pending => "pending",
        Outcome::Succeeded => "succeeded",
        Outcome::Failed => "failed",
        Outcome::Skipped => "skipped",
    }
}

pub fn records_by_outcome(records: &[ApplicationRecord]) -> BTreeMap<&'static str, Vec<&ApplicationRecord>> {
    let mut grouped: BTreeMap<&'static str, Vec<&ApplicationRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(outcome_label(record.outcome)).or_default().push(record);
    }
    grouped
}

/// Plain-text audit listing of the fingerprint store, grouped by outcome.
pub fn render_audit(records: &[ApplicationRecord]) -> String {
    let grouped = records_by_outcome(records);
    let mut out = format!("{} application records\n", records.len());
    for (label, group) in grouped {
        out.push_str(&format!("\n[{label}] {}\n", group.len()));
        for record in group {
            let reason = record
                .reason
                .map(|r| format!(" reason={}", serde_json::to_string(&r).unwrap_or_default().trim_matches('"')))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {} {} | {} @ {} | attempts={}{}\n",
                record.fingerprint.short(),
                record.source_id,
                record.title,
                record.company,
                record.attempt_count,
                reason,
            ));
        }
    }
    out
}
