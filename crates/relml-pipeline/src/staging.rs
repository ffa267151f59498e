use chrono::{DateTime, Utc};
use relml_core::{NormalizedRow, QuarantineReason, QuarantinedRow, UpsertOutcome};
use relml_storage::{ConflictSink, StagingStore, Store, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertTally {
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
    pub conflicts: u64,
}

impl UpsertTally {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Replaced => self.replaced += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Conflict => self.conflicts += 1,
        }
    }

    /// Rows that reached the current-state table or already matched it.
    pub fn clean(&self) -> u64 {
        self.inserted + self.replaced + self.unchanged
    }

    pub fn add(&mut self, other: &UpsertTally) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.conflicts += other.conflicts;
    }
}

/// Merges normalized rows into the current-state table and routes stale-but-different rows to
/// the conflict sink.
pub struct StagingWriter<'a> {
    store: &'a dyn Store,
}

impl<'a> StagingWriter<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        row: &NormalizedRow,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.store.upsert_listing(row, at).await?;
        debug!(
            listing = %row.identity,
            ordinal = row.source_row_ordinal,
            outcome = outcome.as_str(),
            "staged row"
        );
        if outcome == UpsertOutcome::Conflict {
            warn!(
                listing = %row.identity,
                modified_at = %row.modified_at,
                "stale row differs from staged version"
            );
            self.store.record_conflict(&conflict_row(row, at)).await?;
        }
        Ok(outcome)
    }

    /// Rows are applied in order; a storage error stops the batch.
    pub async fn write_all(
        &self,
        rows: &[NormalizedRow],
        at: DateTime<Utc>,
    ) -> Result<UpsertTally, StoreError> {
        let mut tally = UpsertTally::default();
        for row in rows {
            tally.record(self.upsert(row, at).await?);
        }
        Ok(tally)
    }
}

fn conflict_row(row: &NormalizedRow, at: DateTime<Utc>) -> QuarantinedRow {
    QuarantinedRow {
        source_file_hash: row.source_file_hash.clone(),
        source_row_ordinal: row.source_row_ordinal,
        raw_payload: row.raw_payload.clone(),
        reason: QuarantineReason::ConflictingUpdate,
        detail: format!(
            "{} modified at {} is not newer than the staged version and differs in content",
            row.identity,
            row.modified_at.to_rfc3339()
        ),
        recorded_at: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relml_core::{Domain, ListingIdentity};
    use relml_storage::MemoryStore;
    use std::collections::BTreeMap;

    fn row(hour: u32, hash: &str, ordinal: u64) -> NormalizedRow {
        NormalizedRow {
            identity: ListingIdentity::new("HAR7", Domain::Sale),
            modified_at: Utc.with_ymd_and_hms(2024, 2, 1, hour, 0, 0).unwrap(),
            normalized_row_hash: hash.to_string(),
            source_file_hash: "file".to_string(),
            source_row_ordinal: ordinal,
            raw_payload: format!("HAR7,{hour}"),
            expected_image_count: None,
            lifecycle: None,
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn stale_different_rows_go_to_conflict_sink() {
        let store = MemoryStore::new();
        let writer = StagingWriter::new(&store);
        let now = Utc::now();

        let tally = writer
            .write_all(
                &[row(10, "a", 1), row(12, "b", 2), row(11, "c", 3), row(12, "b", 4)],
                now,
            )
            .await
            .expect("write");

        assert_eq!(
            tally,
            UpsertTally {
                inserted: 1,
                replaced: 1,
                unchanged: 1,
                conflicts: 1
            }
        );
        assert_eq!(tally.clean(), 3);

        let conflicts = store.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].source_row_ordinal, 3);
        assert_eq!(conflicts[0].reason, QuarantineReason::ConflictingUpdate);

        let current = store
            .get_listing(&ListingIdentity::new("HAR7", Domain::Sale))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.normalized_row_hash, "b");
    }
}
