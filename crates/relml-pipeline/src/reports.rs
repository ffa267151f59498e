//! Run reports: JSON summary, markdown brief, parquet snapshots and a hashed manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use relml_core::{FileStatus, ListingImageStatus, ListingRecord, QuarantinedRow};
use relml_storage::{
    sha256_hex, ConflictSink, ImageAssetStore, LedgerStore, QuarantineSink, StagingStore, Store,
};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::images::ImageBatchReport;
use crate::ImportSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `run_summary.json`, `brief.md`, snapshots and `manifest.json` under
/// `{reports_root}/{run_id}`.
pub async fn write_import_reports(
    reports_root: &Path,
    summary: &ImportSummary,
    store: &dyn Store,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("brief.md"), import_brief(summary))
        .await
        .context("writing brief.md")?;

    let mut files = vec![
        manifest_entry("run_summary", &reports_dir, &reports_dir.join("run_summary.json"))?,
        manifest_entry("brief", &reports_dir, &reports_dir.join("brief.md"))?,
    ];
    files.extend(export_snapshots(&reports_dir, store).await?);
    write_manifest(&reports_dir, summary.run_id, files).await?;
    Ok(reports_dir)
}

pub async fn write_image_reports(
    reports_root: &Path,
    report: &ImageBatchReport,
    store: &dyn Store,
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing image batch report")?;
    let summary_path = reports_dir.join("image_summary.json");
    fs::write(&summary_path, json)
        .await
        .context("writing image_summary.json")?;

    let mut files = vec![manifest_entry("image_summary", &reports_dir, &summary_path)?];
    files.extend(export_snapshots(&reports_dir, store).await?);
    write_manifest(&reports_dir, report.run_id, files).await?;
    Ok(reports_dir)
}

async fn write_manifest(reports_dir: &Path, run_id: Uuid, files: Vec<ManifestFile>) -> Result<()> {
    let manifest = ReportManifest {
        schema_version: 1,
        run_id,
        files,
    };
    let manifest_path = reports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))
}

async fn export_snapshots(reports_dir: &Path, store: &dyn Store) -> Result<Vec<ManifestFile>> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let listings_path = snapshot_dir.join("listings.parquet");
    let status_path = snapshot_dir.join("image_status.parquet");
    let quarantine_path = snapshot_dir.join("quarantine.parquet");
    let conflicts_path = snapshot_dir.join("conflicts.parquet");

    write_listings_parquet(&listings_path, &store.list_listings().await?)?;
    write_image_status_parquet(&status_path, &store.list_image_statuses().await?)?;
    write_rejected_rows_parquet(&quarantine_path, &store.list_quarantine().await?, "quarantine")?;
    write_rejected_rows_parquet(&conflicts_path, &store.list_conflicts().await?, "conflicts")?;

    Ok(vec![
        manifest_entry("listings", reports_dir, &listings_path)?,
        manifest_entry("image_status", reports_dir, &status_path)?,
        manifest_entry("quarantine", reports_dir, &quarantine_path)?,
        manifest_entry("conflicts", reports_dir, &conflicts_path)?,
    ])
}

fn import_brief(summary: &ImportSummary) -> String {
    let mut by_reason: BTreeMap<&str, u64> = BTreeMap::new();
    for file in &summary.files {
        for (reason, count) in &file.quarantine_by_reason {
            *by_reason.entry(reason.as_str()).or_default() += count;
        }
    }
    let files = summary
        .files
        .iter()
        .map(|file| {
            format!(
                "- `{}` {}: total={} clean={} quarantined={} conflicting={}",
                file.origin_path,
                file.outcome.as_str(),
                file.counts.total,
                file.counts.clean,
                file.counts.quarantined,
                file.counts.conflicting
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let reasons = if by_reason.is_empty() {
        "- none".to_string()
    } else {
        by_reason
            .iter()
            .map(|(reason, count)| format!("- {reason}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# RELML Import Brief\n\n- Run ID: `{}`\n- Root: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Rows: total={} clean={} quarantined={} conflicting={}\n- Upserts: inserted={} replaced={} unchanged={}\n\n## Files\n{}\n\n## Quarantine Reasons\n{}\n",
        summary.run_id,
        summary.root,
        summary.started_at,
        summary.finished_at,
        summary.dry_run,
        summary.totals.total,
        summary.totals.clean,
        summary.totals.quarantined,
        summary.totals.conflicting,
        summary.upserts.inserted,
        summary.upserts.replaced,
        summary.upserts.unchanged,
        if files.is_empty() { "- none".to_string() } else { files },
        reasons
    )
}

/// Markdown overview of everything the store holds.
pub async fn status_markdown(store: &dyn Store) -> Result<String> {
    let files = store.list_files().await?;
    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for file in &files {
        *by_status.entry(file.status.as_str()).or_default() += 1;
    }
    let listings = store.list_listings().await?;
    let quarantine = store.list_quarantine().await?;
    let conflicts = store.list_conflicts().await?;
    let statuses = store.list_image_statuses().await?;

    let mut quarantine_by_reason: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &quarantine {
        *quarantine_by_reason.entry(row.reason.as_str()).or_default() += 1;
    }
    let mut image_states: BTreeMap<&str, usize> = BTreeMap::new();
    for status in &statuses {
        *image_states
            .entry(status.images_download_status().as_str())
            .or_default() += 1;
    }

    let mut lines = vec!["# RELML Status".to_string(), String::new()];
    lines.push(format!("## Ledger ({} files)", files.len()));
    for status in [
        FileStatus::Discovered,
        FileStatus::Ingested,
        FileStatus::Skipped,
        FileStatus::Failed,
    ] {
        let count = by_status.get(status.as_str()).copied().unwrap_or(0);
        lines.push(format!("- {}: {count}", status.as_str()));
    }
    for file in files.iter().filter(|f| f.status == FileStatus::Failed) {
        let detail = file
            .error_detail
            .as_ref()
            .map(|d| format!("{}: {}", d.kind, d.message))
            .unwrap_or_default();
        lines.push(format!(
            "  - failed `{}` (attempts {}) {detail}",
            file.origin_path, file.attempts
        ));
    }
    lines.push(String::new());
    lines.push(format!("## Staging\n- listings: {}", listings.len()));
    lines.push(format!("- conflicts: {}", conflicts.len()));
    lines.push(format!("- quarantined rows: {}", quarantine.len()));
    for (reason, count) in &quarantine_by_reason {
        lines.push(format!("  - {reason}: {count}"));
    }
    lines.push(String::new());
    lines.push(format!("## Images ({} listings)", statuses.len()));
    for (state, count) in &image_states {
        lines.push(format!("- {state}: {count}"));
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
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

fn write_listings_parquet(path: &Path, listings: &[ListingRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_key", DataType::Utf8, false),
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("modified_at", DataType::Utf8, false),
        ArrowField::new("normalized_row_hash", DataType::Utf8, false),
        ArrowField::new("source_file_hash", DataType::Utf8, false),
        ArrowField::new("source_row_ordinal", DataType::UInt64, false),
        ArrowField::new("expected_image_count", DataType::UInt32, true),
        ArrowField::new("lifecycle", DataType::Utf8, true),
        ArrowField::new("attributes_json", DataType::Utf8, false),
        ArrowField::new("staged_at", DataType::Utf8, false),
    ]));

    let attributes = listings
        .iter()
        .map(|l| serde_json::to_string(&l.attributes))
        .collect::<Result<Vec<_>, _>>()
        .context("serializing listing attributes")?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.identity.listing_key.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.identity.domain.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.modified_at.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.normalized_row_hash.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.source_file_hash.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            listings
                .iter()
                .map(|l| l.source_row_ordinal)
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            listings
                .iter()
                .map(|l| l.expected_image_count)
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| l.lifecycle.map(|s| s.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            attributes.iter().map(|a| Some(a.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            listings
                .iter()
                .map(|l| Some(l.staged_at.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
    ];

    let batch =
        RecordBatch::try_new(schema, columns).context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_image_status_parquet(path: &Path, statuses: &[ListingImageStatus]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("listing_key", DataType::Utf8, false),
        ArrowField::new("domain", DataType::Utf8, false),
        ArrowField::new("images_count", DataType::UInt32, false),
        ArrowField::new("expected_count", DataType::UInt32, true),
        ArrowField::new("extraction_error", DataType::Boolean, false),
        ArrowField::new("images_download_status", DataType::Utf8, false),
        ArrowField::new("images_last_checked", DataType::Utf8, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            statuses
                .iter()
                .map(|s| Some(s.identity().listing_key.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            statuses
                .iter()
                .map(|s| Some(s.identity().domain.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            statuses.iter().map(|s| s.images_count()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            statuses.iter().map(|s| s.expected_count()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            statuses
                .iter()
                .map(|s| s.extraction_error())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            statuses
                .iter()
                .map(|s| Some(s.images_download_status().as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            statuses
                .iter()
                .map(|s| Some(s.images_last_checked().to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
    ];

    let batch =
        RecordBatch::try_new(schema, columns).context("building image_status record batch")?;
    write_parquet(path, batch)
}

fn write_rejected_rows_parquet(path: &Path, rows: &[QuarantinedRow], label: &str) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_file_hash", DataType::Utf8, false),
        ArrowField::new("source_row_ordinal", DataType::UInt64, false),
        ArrowField::new("reason", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, false),
        ArrowField::new("raw_payload", DataType::Utf8, false),
        ArrowField::new("recorded_at", DataType::Utf8, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.source_file_hash.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            rows.iter().map(|r| r.source_row_ordinal).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(r.reason.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|r| Some(r.detail.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.raw_payload.as_str()))
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|r| Some(r.recorded_at.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
    ];

    let batch = RecordBatch::try_new(schema, columns)
        .with_context(|| format!("building {label} record batch"))?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
