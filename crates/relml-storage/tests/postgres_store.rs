//! PgStore against a live database. Every test returns early when DATABASE_URL is unset.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use relml_core::{
    Domain, FileStatus, ListingIdentity, NormalizedRow, QuarantineReason, QuarantinedRow,
    RowCounts, UpsertOutcome,
};
use relml_storage::{LedgerStore, PgStore, QuarantineSink, StagingStore, StoreError};
use uuid::Uuid;

async fn connect() -> Option<PgStore> {
    let url = std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty())?;
    let store = PgStore::connect(&url, 8).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
}

fn row(key: &str, modified_at: DateTime<Utc>, hash: &str) -> NormalizedRow {
    NormalizedRow {
        identity: ListingIdentity::new(key, Domain::Sale),
        modified_at,
        normalized_row_hash: hash.to_string(),
        source_file_hash: "file-a".to_string(),
        source_row_ordinal: 1,
        raw_payload: format!("{key},x"),
        expected_image_count: Some(3),
        lifecycle: None,
        attributes: BTreeMap::from([("listing_key".to_string(), key.to_string())]),
    }
}

#[tokio::test]
async fn ledger_finalizes_once_and_reopens_failures() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let hash = unique("ledger");

    let first = store.record_discovery(&hash, "a.csv", ts(1)).await.unwrap();
    assert_eq!(first.status, FileStatus::Discovered);
    assert_eq!(first.attempts, 1);
    assert!(!store.is_already_ingested(&hash).await.unwrap());

    store
        .finalize(&hash, FileStatus::Failed, RowCounts::default(), None, ts(2))
        .await
        .unwrap();
    assert!(!store.is_already_ingested(&hash).await.unwrap());

    let reopened = store.record_discovery(&hash, "a.csv", ts(3)).await.unwrap();
    assert_eq!(reopened.status, FileStatus::Discovered);
    assert_eq!(reopened.attempts, 2);
    assert!(reopened.error_detail.is_none());

    let counts = RowCounts {
        total: 2,
        clean: 2,
        quarantined: 0,
        conflicting: 0,
    };
    let done = store
        .finalize(&hash, FileStatus::Ingested, counts, None, ts(4))
        .await
        .unwrap();
    assert_eq!(done.counts, counts);
    assert!(store.is_already_ingested(&hash).await.unwrap());

    let again = store
        .finalize(&hash, FileStatus::Ingested, RowCounts::default(), None, ts(5))
        .await
        .unwrap();
    assert_eq!(again.counts, counts, "repeating the same status changes nothing");

    let err = store
        .finalize(&hash, FileStatus::Skipped, RowCounts::default(), None, ts(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::AlreadyFinalized {
            existing: FileStatus::Ingested,
            requested: FileStatus::Skipped,
            ..
        }
    ));

    let unchanged = store.record_discovery(&hash, "b.csv", ts(6)).await.unwrap();
    assert_eq!(unchanged.status, FileStatus::Ingested);
    assert_eq!(unchanged.attempts, 2);
}

#[tokio::test]
async fn finalize_requires_a_discovered_entry() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let err = store
        .finalize(&unique("absent"), FileStatus::Ingested, RowCounts::default(), None, ts(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownFile(_)));
}

#[tokio::test]
async fn concurrent_upserts_converge_on_the_newest_version() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let key = unique("K");

    let mut handles = Vec::new();
    for hour in 1..=8u32 {
        let store = store.clone();
        let row = row(&key, ts(hour), &format!("hash-{hour}"));
        handles.push(tokio::spawn(async move {
            store.upsert_listing(&row, ts(12)).await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.expect("join").expect("upsert"));
    }

    let identity = ListingIdentity::new(key.clone(), Domain::Sale);
    let current = store.get_listing(&identity).await.unwrap().expect("listing");
    assert_eq!(current.modified_at, ts(8));
    assert_eq!(current.normalized_row_hash, "hash-8");
    assert_eq!(current.expected_image_count, Some(3));

    let inserted = outcomes
        .iter()
        .filter(|o| **o == UpsertOutcome::Inserted)
        .count();
    let replaced = outcomes
        .iter()
        .filter(|o| **o == UpsertOutcome::Replaced)
        .count();
    assert_eq!(inserted, 1);
    let history = store.list_history(&identity).await.unwrap();
    assert_eq!(history.len(), replaced);
    assert!(history.iter().all(|h| h.record.modified_at < ts(8)));

    let stale = store
        .upsert_listing(&row(&key, ts(2), "hash-2"), ts(13))
        .await
        .unwrap();
    assert_eq!(stale, UpsertOutcome::Conflict);
    let same = store
        .upsert_listing(&row(&key, ts(8), "hash-8"), ts(13))
        .await
        .unwrap();
    assert_eq!(same, UpsertOutcome::Unchanged);
}

#[tokio::test]
async fn microsecond_timestamps_survive_the_round_trip() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let key = unique("K");
    let modified_at = ts(9) + chrono::Duration::microseconds(123_456);
    store
        .upsert_listing(&row(&key, modified_at, "h"), ts(12))
        .await
        .unwrap();

    let identity = ListingIdentity::new(key.clone(), Domain::Sale);
    let stored = store.get_listing(&identity).await.unwrap().expect("listing");
    assert_eq!(stored.modified_at, modified_at);
    let again = store
        .upsert_listing(&row(&key, modified_at, "h"), ts(13))
        .await
        .unwrap();
    assert_eq!(again, UpsertOutcome::Unchanged);
}

#[tokio::test]
async fn quarantine_is_deduplicated() {
    let Some(store) = connect().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let file = unique("file");
    let rows: Vec<_> = [1u64, 2]
        .into_iter()
        .map(|ordinal| QuarantinedRow {
            source_file_hash: file.clone(),
            source_row_ordinal: ordinal,
            raw_payload: "raw".to_string(),
            reason: QuarantineReason::IdentityMissing,
            detail: "identity_missing".to_string(),
            recorded_at: ts(1),
        })
        .collect();

    assert_eq!(store.record_quarantine(&rows).await.unwrap(), 2);
    assert_eq!(store.record_quarantine(&rows).await.unwrap(), 0);
    let stored = store
        .list_quarantine()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.source_file_hash == file)
        .count();
    assert_eq!(stored, 2);
}
