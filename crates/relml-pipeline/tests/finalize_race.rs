use std::fs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relml_core::{
    ErrorDetail, FileStatus, ImageAsset, IngestedFile, ListingHistoryEntry, ListingIdentity,
    ListingImageStatus, ListingRecord, NormalizedRow, QuarantinedRow, RowCounts, UpsertOutcome,
};
use relml_ingest::SchemaSpec;
use relml_pipeline::{CsvImportPipeline, FileOutcome};
use relml_storage::{
    ConflictSink, ImageAssetStore, LedgerStore, MemoryStore, QuarantineSink, StagingStore,
    StoreError,
};
use tempfile::tempdir;

/// Another worker finalizes every file with `rival` just before this one does.
struct RacingStore {
    inner: MemoryStore,
    rival: FileStatus,
}

#[async_trait]
impl LedgerStore for RacingStore {
    async fn record_discovery(
        &self,
        content_hash: &str,
        origin_path: &str,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError> {
        self.inner.record_discovery(content_hash, origin_path, at).await
    }

    async fn is_already_ingested(&self, content_hash: &str) -> Result<bool, StoreError> {
        self.inner.is_already_ingested(content_hash).await
    }

    async fn finalize(
        &self,
        content_hash: &str,
        status: FileStatus,
        counts: RowCounts,
        error_detail: Option<ErrorDetail>,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError> {
        self.inner
            .finalize(content_hash, self.rival, RowCounts::default(), None, at)
            .await?;
        self.inner
            .finalize(content_hash, status, counts, error_detail, at)
            .await
    }

    async fn get_file(&self, content_hash: &str) -> Result<Option<IngestedFile>, StoreError> {
        self.inner.get_file(content_hash).await
    }

    async fn list_files(&self) -> Result<Vec<IngestedFile>, StoreError> {
        self.inner.list_files().await
    }
}

#[async_trait]
impl StagingStore for RacingStore {
    async fn upsert_listing(
        &self,
        row: &NormalizedRow,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.inner.upsert_listing(row, at).await
    }

    async fn get_listing(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingRecord>, StoreError> {
        self.inner.get_listing(identity).await
    }

    async fn list_listings(&self) -> Result<Vec<ListingRecord>, StoreError> {
        self.inner.list_listings().await
    }

    async fn list_history(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Vec<ListingHistoryEntry>, StoreError> {
        self.inner.list_history(identity).await
    }
}

#[async_trait]
impl QuarantineSink for RacingStore {
    async fn record_quarantine(&self, rows: &[QuarantinedRow]) -> Result<u64, StoreError> {
        self.inner.record_quarantine(rows).await
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        self.inner.list_quarantine().await
    }
}

#[async_trait]
impl ConflictSink for RacingStore {
    async fn record_conflict(&self, row: &QuarantinedRow) -> Result<bool, StoreError> {
        self.inner.record_conflict(row).await
    }

    async fn list_conflicts(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        self.inner.list_conflicts().await
    }
}

#[async_trait]
impl ImageAssetStore for RacingStore {
    async fn has_image_asset(
        &self,
        identity: &ListingIdentity,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        self.inner.has_image_asset(identity, content_hash).await
    }

    async fn insert_image_asset(&self, asset: &ImageAsset) -> Result<bool, StoreError> {
        self.inner.insert_image_asset(asset).await
    }

    async fn count_image_assets(&self, identity: &ListingIdentity) -> Result<u32, StoreError> {
        self.inner.count_image_assets(identity).await
    }

    async fn list_image_assets(&self) -> Result<Vec<ImageAsset>, StoreError> {
        self.inner.list_image_assets().await
    }

    async fn put_image_status(&self, status: &ListingImageStatus) -> Result<(), StoreError> {
        self.inner.put_image_status(status).await
    }

    async fn get_image_status(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingImageStatus>, StoreError> {
        self.inner.get_image_status(identity).await
    }

    async fn list_image_statuses(&self) -> Result<Vec<ListingImageStatus>, StoreError> {
        self.inner.list_image_statuses().await
    }

    async fn mark_orphaned(&self, identity: &ListingIdentity) -> Result<u64, StoreError> {
        self.inner.mark_orphaned(identity).await
    }
}

#[tokio::test]
async fn losing_the_finalize_race_reports_skipped() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("day1.csv"),
        "ListingKey,Domain,Matrix_Modified_DT,Zip\nK1,SALE,2024-01-01T00:00:00Z,77024\n",
    )
    .unwrap();
    let store = RacingStore {
        inner: MemoryStore::new(),
        rival: FileStatus::Failed,
    };

    let summary = CsvImportPipeline::new(&store, SchemaSpec::listing_default())
        .run(dir.path())
        .await
        .expect("a lost race is not a run error");

    let report = &summary.files[0];
    assert_eq!(report.outcome, FileOutcome::Skipped);
    assert_eq!(report.ledger_status, Some(FileStatus::Failed));
    assert_eq!(report.upserts.inserted, 1);

    let hash = report.content_hash.clone().expect("hash");
    let entry = store.get_file(&hash).await.unwrap().expect("ledger entry");
    assert_eq!(entry.status, FileStatus::Failed, "the winner's status stands");
    assert_eq!(store.list_listings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn losing_the_race_on_a_failed_file_reports_skipped() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("broken.csv"),
        "ListingKey,Dom\"ain,Matrix_Modified_DT\nK1,SALE,2024-01-01T00:00:00Z\n",
    )
    .unwrap();
    let store = RacingStore {
        inner: MemoryStore::new(),
        rival: FileStatus::Ingested,
    };

    let summary = CsvImportPipeline::new(&store, SchemaSpec::listing_default())
        .run(dir.path())
        .await
        .expect("run");

    let report = &summary.files[0];
    assert_eq!(report.outcome, FileOutcome::Skipped);
    assert_eq!(report.ledger_status, Some(FileStatus::Ingested));
    assert!(report.error.is_some());
}
