//! Ingestion orchestration: ledger-gated CSV import, image indexing and run reports.

mod images;
mod reports;
mod staging;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relml_core::{ErrorDetail, FileStatus, RowCounts};
use relml_ingest::{route_csv, RowContext, SchemaSpec};
use relml_storage::{sha256_file_hex, LedgerStore, QuarantineSink, Store, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub use images::{fetch_plan, FetchPlanEntry, ImageBatchReport, ImageIndexer, ImageStatusLine};
pub use reports::{
    status_markdown, write_image_reports, write_import_reports, ManifestFile, ReportManifest,
};
pub use staging::{StagingWriter, UpsertTally};

pub const CRATE_NAME: &str = "relml-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub data_root: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub reports_enabled: bool,
    pub max_connections: u32,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            data_root: std::env::var("RELML_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            schema_path: std::env::var("RELML_SCHEMA_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            reports_enabled: std::env::var("RELML_REPORTS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False" | "off"))
                .unwrap_or(true),
            max_connections: std::env::var("RELML_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }

    pub fn images_root(&self) -> PathBuf {
        self.data_root.join("stage").join("images")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.data_root.join("reports")
    }

    /// False when no DATABASE_URL is configured and every run starts from an empty store.
    pub fn is_persistent(&self) -> bool {
        self.database_url.is_some()
    }

    /// The YAML schema when one is configured, otherwise the built-in listing schema.
    pub fn load_schema(&self) -> Result<SchemaSpec> {
        match &self.schema_path {
            Some(path) => SchemaSpec::load(path)
                .with_context(|| format!("loading schema {}", path.display())),
            None => Ok(SchemaSpec::listing_default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Ingested,
    Skipped,
    Failed,
    AlreadyIngested,
    DryRun,
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Ingested => "ingested",
            FileOutcome::Skipped => "skipped",
            FileOutcome::Failed => "failed",
            FileOutcome::AlreadyIngested => "already_ingested",
            FileOutcome::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub origin_path: String,
    pub content_hash: Option<String>,
    pub outcome: FileOutcome,
    pub ledger_status: Option<FileStatus>,
    pub counts: RowCounts,
    pub upserts: UpsertTally,
    pub quarantine_by_reason: BTreeMap<String, u64>,
    pub error: Option<ErrorDetail>,
}

impl FileReport {
    fn new(origin_path: String, content_hash: Option<String>, outcome: FileOutcome) -> Self {
        Self {
            origin_path,
            content_hash,
            outcome,
            ledger_status: None,
            counts: RowCounts::default(),
            upserts: UpsertTally::default(),
            quarantine_by_reason: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub root: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub files: Vec<FileReport>,
    pub totals: RowCounts,
    pub upserts: UpsertTally,
}

impl ImportSummary {
    pub fn count(&self, outcome: FileOutcome) -> usize {
        self.files.iter().filter(|f| f.outcome == outcome).count()
    }
}

/// Every `*.csv` under `root`, recursively, in path order. Symlinks are not followed and a
/// missing root yields nothing.
pub fn discover_csv_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        warn!(root = %root.display(), "import root does not exist");
        return Ok(Vec::new());
    }
    if root.is_file() {
        return Ok(if is_csv(root) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_csv(entry.path()) => {
                found.push(entry.into_path());
            }
            Ok(_) => {}
            Err(err) => warn!(root = %root.display(), error = %err, "skipping unreadable entry"),
        }
    }
    found.sort();
    Ok(found)
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
}

/// Ledger-gated CSV import. Each file is hashed, checked against the ledger, validated row by
/// row and finalized exactly once.
pub struct CsvImportPipeline<'a> {
    store: &'a dyn Store,
    schema: SchemaSpec,
    dry_run: bool,
}

impl<'a> CsvImportPipeline<'a> {
    pub fn new(store: &'a dyn Store, schema: SchemaSpec) -> Self {
        Self {
            store,
            schema,
            dry_run: false,
        }
    }

    /// Validate and count without touching the store.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(&self, root: &Path) -> Result<ImportSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let files = discover_csv_files(root)?;
        info!(
            %run_id,
            root = %root.display(),
            files = files.len(),
            dry_run = self.dry_run,
            "csv import started"
        );

        let mut summary = ImportSummary {
            run_id,
            root: root.display().to_string(),
            started_at,
            finished_at: started_at,
            dry_run: self.dry_run,
            files: Vec::with_capacity(files.len()),
            totals: RowCounts::default(),
            upserts: UpsertTally::default(),
        };
        for path in &files {
            let report = self.import_file(path).await?;
            summary.totals.add(&report.counts);
            summary.upserts.add(&report.upserts);
            summary.files.push(report);
        }
        summary.finished_at = Utc::now();

        info!(
            %run_id,
            ingested = summary.count(FileOutcome::Ingested),
            skipped = summary.count(FileOutcome::Skipped),
            failed = summary.count(FileOutcome::Failed),
            already_ingested = summary.count(FileOutcome::AlreadyIngested),
            clean = summary.totals.clean,
            quarantined = summary.totals.quarantined,
            conflicting = summary.totals.conflicting,
            "csv import finished"
        );
        Ok(summary)
    }

    /// Storage errors are returned as `Err` and leave the ledger entry `discovered`.
    pub async fn import_file(&self, path: &Path) -> Result<FileReport> {
        let origin = path.display().to_string();
        let content_hash = match sha256_file_hex(path).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(file = %origin, error = %err, "cannot hash file");
                let mut report = FileReport::new(origin, None, FileOutcome::Failed);
                report.error = Some(ErrorDetail::new("io", err.to_string()));
                return Ok(report);
            }
        };
        let span = info_span!("csv_file", file = %origin, content_hash = %content_hash);
        self.import_hashed(path, origin, content_hash)
            .instrument(span)
            .await
    }

    async fn import_hashed(
        &self,
        path: &Path,
        origin: String,
        content_hash: String,
    ) -> Result<FileReport> {
        if self.store.is_already_ingested(&content_hash).await? {
            info!("already ingested; skipping");
            let mut report =
                FileReport::new(origin, Some(content_hash.clone()), FileOutcome::AlreadyIngested);
            report.ledger_status = self
                .store
                .get_file(&content_hash)
                .await?
                .map(|entry| entry.status);
            return Ok(report);
        }

        if !self.dry_run {
            let entry = self
                .store
                .record_discovery(&content_hash, &origin, Utc::now())
                .await?;
            if entry.attempts > 1 {
                info!(attempts = entry.attempts, "retrying previously failed file");
            }
        }

        let context = RowContext::new(content_hash.clone(), path, Utc::now());
        let routed = File::open(path)
            .map_err(|err| ErrorDetail::new("io", err.to_string()))
            .and_then(|file| {
                route_csv(&self.schema, BufReader::new(file), &context)
                    .map_err(|err| ErrorDetail::new(err.kind(), err.to_string()))
            });
        let outcome = match routed {
            Ok(outcome) => outcome,
            Err(detail) => {
                warn!(kind = %detail.kind, error = %detail.message, "file could not be read");
                return self
                    .finish_failed(origin, content_hash, RowCounts::default(), detail, BTreeMap::new())
                    .await;
            }
        };

        let rows = outcome.rows;
        let mut by_reason: BTreeMap<String, u64> = BTreeMap::new();
        for row in &rows.quarantined {
            *by_reason.entry(row.reason.as_str().to_string()).or_default() += 1;
        }
        let quarantined = rows.quarantined.len() as u64;

        if self.dry_run {
            let mut report =
                FileReport::new(origin, Some(content_hash), FileOutcome::DryRun);
            report.counts = RowCounts {
                total: rows.total,
                clean: rows.clean.len() as u64,
                quarantined,
                conflicting: 0,
            };
            report.quarantine_by_reason = by_reason;
            report.error = outcome
                .fatal
                .map(|err| ErrorDetail::new(err.kind(), err.to_string()));
            return Ok(report);
        }

        if !rows.quarantined.is_empty() {
            self.store.record_quarantine(&rows.quarantined).await?;
        }

        if let Some(err) = outcome.fatal {
            warn!(error = %err, rows_read = rows.total, "file stopped mid-read; clean rows discarded");
            let counts = RowCounts {
                total: rows.total,
                clean: 0,
                quarantined,
                conflicting: 0,
            };
            let detail = ErrorDetail::new(err.kind(), err.to_string());
            return self
                .finish_failed(origin, content_hash, counts, detail, by_reason)
                .await;
        }

        let tally = StagingWriter::new(self.store)
            .write_all(&rows.clean, Utc::now())
            .await?;
        let counts = RowCounts {
            total: rows.total,
            clean: tally.clean(),
            quarantined,
            conflicting: tally.conflicts,
        };
        let status = if rows.total == 0 {
            FileStatus::Skipped
        } else {
            FileStatus::Ingested
        };

        let mut report = FileReport::new(origin, Some(content_hash.clone()), FileOutcome::Skipped);
        report.counts = counts;
        report.upserts = tally;
        report.quarantine_by_reason = by_reason;
        match self
            .store
            .finalize(&content_hash, status, counts, None, Utc::now())
            .await
        {
            Ok(entry) => {
                report.outcome = match entry.status {
                    FileStatus::Ingested => FileOutcome::Ingested,
                    _ => FileOutcome::Skipped,
                };
                report.ledger_status = Some(entry.status);
            }
            Err(StoreError::AlreadyFinalized { existing, .. }) => {
                warn!(existing = %existing, "finalized by another worker");
                report.ledger_status = Some(existing);
            }
            Err(err) => return Err(err).context("finalizing ledger entry"),
        }
        info!(
            status = report.outcome.as_str(),
            total = counts.total,
            clean = counts.clean,
            quarantined = counts.quarantined,
            conflicting = counts.conflicting,
            inserted = tally.inserted,
            replaced = tally.replaced,
            unchanged = tally.unchanged,
            "file processed"
        );
        Ok(report)
    }

    async fn finish_failed(
        &self,
        origin: String,
        content_hash: String,
        counts: RowCounts,
        detail: ErrorDetail,
        by_reason: BTreeMap<String, u64>,
    ) -> Result<FileReport> {
        let mut report = FileReport::new(origin, Some(content_hash.clone()), FileOutcome::Failed);
        report.counts = counts;
        report.quarantine_by_reason = by_reason;
        report.error = Some(detail.clone());
        if self.dry_run {
            return Ok(report);
        }
        match self
            .store
            .finalize(
                &content_hash,
                FileStatus::Failed,
                counts,
                Some(detail),
                Utc::now(),
            )
            .await
        {
            Ok(entry) => report.ledger_status = Some(entry.status),
            Err(StoreError::AlreadyFinalized { existing, .. }) => {
                warn!(existing = %existing, "finalized by another worker");
                report.outcome = FileOutcome::Skipped;
                report.ledger_status = Some(existing);
            }
            Err(err) => return Err(err).context("finalizing ledger entry"),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_sorted_and_case_insensitive() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("b/nested/z.CSV"), "x").unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = discover_csv_files(dir.path()).expect("discover");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(names, vec!["a.csv", "b/nested/z.CSV"]);
    }

    #[test]
    fn missing_root_discovers_nothing() {
        let dir = tempdir().expect("tempdir");
        assert!(discover_csv_files(&dir.path().join("absent"))
            .expect("discover")
            .is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn discovery_does_not_follow_symlinks() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("drop/inner")).unwrap();
        fs::write(dir.path().join("drop/inner/a.csv"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("drop"), dir.path().join("drop/inner/loop"))
            .unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("drop/inner/a.csv"),
            dir.path().join("drop/alias.csv"),
        )
        .unwrap();

        let files = discover_csv_files(dir.path()).expect("discover");
        assert_eq!(files, vec![dir.path().join("drop/inner/a.csv")]);
    }

    #[test]
    fn config_without_database_is_ephemeral() {
        let mut config = PipelineConfig {
            database_url: None,
            data_root: PathBuf::from("data"),
            schema_path: None,
            reports_enabled: true,
            max_connections: 5,
        };
        assert!(!config.is_persistent());
        config.database_url = Some("postgres://localhost/relml".to_string());
        assert!(config.is_persistent());
    }

    #[test]
    fn config_paths_hang_off_data_root() {
        let config = PipelineConfig {
            database_url: None,
            data_root: PathBuf::from("/srv/relml"),
            schema_path: None,
            reports_enabled: true,
            max_connections: 5,
        };
        assert_eq!(config.images_root(), PathBuf::from("/srv/relml/stage/images"));
        assert_eq!(config.reports_root(), PathBuf::from("/srv/relml/reports"));
        assert_eq!(
            config.load_schema().expect("schema"),
            SchemaSpec::listing_default()
        );
    }
}
