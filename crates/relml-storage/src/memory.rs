//! In-process store with the same contract as the Postgres store.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relml_core::{
    ErrorDetail, FileStatus, ImageAsset, IngestedFile, ListingHistoryEntry, ListingIdentity,
    ListingImageStatus, ListingRecord, NormalizedRow, QuarantineReason, QuarantinedRow, RowCounts,
    UpsertOutcome,
};
use tokio::sync::Mutex;

use crate::{
    ConflictSink, ImageAssetStore, LedgerStore, QuarantineSink, StagingStore, StoreError,
};

type RowKey = (String, u64, QuarantineReason);

#[derive(Debug, Default)]
struct AppendOnlyRows {
    rows: Vec<QuarantinedRow>,
    keys: HashSet<RowKey>,
}

impl AppendOnlyRows {
    fn push(&mut self, row: &QuarantinedRow) -> bool {
        if !self.keys.insert(row.dedup_key()) {
            return false;
        }
        self.rows.push(row.clone());
        true
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    ledger: BTreeMap<String, IngestedFile>,
    listings: BTreeMap<ListingIdentity, ListingRecord>,
    history: Vec<ListingHistoryEntry>,
    quarantine: AppendOnlyRows,
    conflicts: AppendOnlyRows,
    images: BTreeMap<(ListingIdentity, String), ImageAsset>,
    image_status: BTreeMap<ListingIdentity, ListingImageStatus>,
}

/// All state sits behind one lock, so every operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn record_discovery(
        &self,
        content_hash: &str,
        origin_path: &str,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .ledger
            .entry(content_hash.to_string())
            .or_insert_with(|| IngestedFile::discovered(content_hash, origin_path, at));
        if entry.status == FileStatus::Failed {
            entry.status = FileStatus::Discovered;
            entry.origin_path = origin_path.to_string();
            entry.ingested_at = None;
            entry.error_detail = None;
            entry.counts = RowCounts::default();
            entry.attempts += 1;
        }
        Ok(entry.clone())
    }

    async fn is_already_ingested(&self, content_hash: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .get(content_hash)
            .is_some_and(|f| f.status.blocks_reprocessing()))
    }

    async fn finalize(
        &self,
        content_hash: &str,
        status: FileStatus,
        counts: RowCounts,
        error_detail: Option<ErrorDetail>,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NonTerminalStatus(status));
        }
        let mut state = self.state.lock().await;
        let entry = state
            .ledger
            .get_mut(content_hash)
            .ok_or_else(|| StoreError::UnknownFile(content_hash.to_string()))?;
        match entry.status {
            FileStatus::Discovered => {
                entry.status = status;
                entry.counts = counts;
                entry.error_detail = error_detail;
                entry.ingested_at = Some(at);
                Ok(entry.clone())
            }
            existing if existing == status => Ok(entry.clone()),
            existing => Err(StoreError::AlreadyFinalized {
                content_hash: content_hash.to_string(),
                existing,
                requested: status,
            }),
        }
    }

    async fn get_file(&self, content_hash: &str) -> Result<Option<IngestedFile>, StoreError> {
        Ok(self.state.lock().await.ledger.get(content_hash).cloned())
    }

    async fn list_files(&self) -> Result<Vec<IngestedFile>, StoreError> {
        let state = self.state.lock().await;
        let mut files = state.ledger.values().cloned().collect::<Vec<_>>();
        files.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.origin_path.cmp(&b.origin_path))
        });
        Ok(files)
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn upsert_listing(
        &self,
        row: &NormalizedRow,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(existing) = state.listings.get(&row.identity) else {
            state
                .listings
                .insert(row.identity.clone(), ListingRecord::from_row(row, at));
            return Ok(UpsertOutcome::Inserted);
        };

        if row.modified_at > existing.modified_at {
            let superseded = ListingHistoryEntry {
                record: existing.clone(),
                superseded_at: at,
                superseded_by_hash: row.normalized_row_hash.clone(),
            };
            state.history.push(superseded);
            state
                .listings
                .insert(row.identity.clone(), ListingRecord::from_row(row, at));
            return Ok(UpsertOutcome::Replaced);
        }

        if row.normalized_row_hash == existing.normalized_row_hash {
            Ok(UpsertOutcome::Unchanged)
        } else {
            Ok(UpsertOutcome::Conflict)
        }
    }

    async fn get_listing(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingRecord>, StoreError> {
        Ok(self.state.lock().await.listings.get(identity).cloned())
    }

    async fn list_listings(&self) -> Result<Vec<ListingRecord>, StoreError> {
        Ok(self.state.lock().await.listings.values().cloned().collect())
    }

    async fn list_history(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Vec<ListingHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| &h.record.identity == identity)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuarantineSink for MemoryStore {
    async fn record_quarantine(&self, rows: &[QuarantinedRow]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(rows.iter().filter(|row| state.quarantine.push(row)).count() as u64)
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        Ok(self.state.lock().await.quarantine.rows.clone())
    }
}

#[async_trait]
impl ConflictSink for MemoryStore {
    async fn record_conflict(&self, row: &QuarantinedRow) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.conflicts.push(row))
    }

    async fn list_conflicts(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        Ok(self.state.lock().await.conflicts.rows.clone())
    }
}

#[async_trait]
impl ImageAssetStore for MemoryStore {
    async fn has_image_asset(
        &self,
        identity: &ListingIdentity,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .images
            .contains_key(&(identity.clone(), content_hash.to_string())))
    }

    async fn insert_image_asset(&self, asset: &ImageAsset) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (asset.identity.clone(), asset.content_hash.clone());
        if state.images.contains_key(&key) {
            return Ok(false);
        }
        state.images.insert(key, asset.clone());
        Ok(true)
    }

    async fn count_image_assets(&self, identity: &ListingIdentity) -> Result<u32, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .images
            .keys()
            .filter(|(id, _)| id == identity)
            .count() as u32)
    }

    async fn list_image_assets(&self) -> Result<Vec<ImageAsset>, StoreError> {
        Ok(self.state.lock().await.images.values().cloned().collect())
    }

    async fn put_image_status(&self, status: &ListingImageStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .image_status
            .insert(status.identity().clone(), status.clone());
        Ok(())
    }

    async fn get_image_status(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingImageStatus>, StoreError> {
        Ok(self.state.lock().await.image_status.get(identity).cloned())
    }

    async fn list_image_statuses(&self) -> Result<Vec<ListingImageStatus>, StoreError> {
        Ok(self.state.lock().await.image_status.values().cloned().collect())
    }

    async fn mark_orphaned(&self, identity: &ListingIdentity) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut flagged = 0;
        for ((id, _), asset) in state.images.iter_mut() {
            if id == identity && !asset.orphaned {
                asset.orphaned = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}
