//! PostgreSQL-backed store. Uniqueness and the per-identity compare-and-swap are enforced
//! by primary keys and row locks.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relml_core::{
    Domain, ErrorDetail, FileStatus, ImageAsset, ImageSource, IngestedFile, ListingHistoryEntry,
    ListingIdentity, ListingImageStatus, ListingLifecycle, ListingRecord, NormalizedRow,
    QuarantinedRow, RowCounts, UpsertOutcome,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;

use crate::{
    ConflictSink, ImageAssetStore, LedgerStore, QuarantineSink, StagingStore, StoreError,
};

const LEDGER_COLUMNS: &str = "content_hash, origin_path, discovered_at, ingested_at, status, \
     rows_total, rows_clean, rows_quarantined, rows_conflicting, error_detail, attempts";

const LISTING_COLUMNS: &str = "listing_key, domain, modified_at, normalized_row_hash, \
     source_file_hash, source_row_ordinal, expected_image_count, lifecycle, attributes, staged_at";

const IMAGE_COLUMNS: &str = "listing_key, domain, content_hash, original_filename, \
     sequence_number, byte_size, source, stored_path, indexed_at, orphaned";

const STATUS_COLUMNS: &str = "listing_key, domain, images_count, expected_count, \
     extraction_error, images_last_checked";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("ingestion schema migrations applied");
        Ok(())
    }
}

fn decode<T, E: std::fmt::Display>(value: Result<T, E>) -> Result<T, StoreError> {
    value.map_err(|e| StoreError::Decode(e.to_string()))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn ledger_from_row(row: &PgRow) -> Result<IngestedFile, StoreError> {
    let status: String = row.try_get("status")?;
    let error_detail: Option<Json<ErrorDetail>> = row.try_get("error_detail")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(IngestedFile {
        content_hash: row.try_get("content_hash")?,
        origin_path: row.try_get("origin_path")?,
        discovered_at: row.try_get("discovered_at")?,
        ingested_at: row.try_get("ingested_at")?,
        status: decode(status.parse::<FileStatus>())?,
        counts: RowCounts {
            total: to_u64(row.try_get("rows_total")?),
            clean: to_u64(row.try_get("rows_clean")?),
            quarantined: to_u64(row.try_get("rows_quarantined")?),
            conflicting: to_u64(row.try_get("rows_conflicting")?),
        },
        error_detail: error_detail.map(|Json(detail)| detail),
        attempts: u32::try_from(attempts).unwrap_or(0),
    })
}

fn identity_from_row(row: &PgRow) -> Result<ListingIdentity, StoreError> {
    let domain: String = row.try_get("domain")?;
    Ok(ListingIdentity {
        listing_key: row.try_get("listing_key")?,
        domain: decode(domain.parse::<Domain>())?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<ListingRecord, StoreError> {
    let expected: Option<i32> = row.try_get("expected_image_count")?;
    let lifecycle: Option<String> = row.try_get("lifecycle")?;
    let Json(attributes): Json<BTreeMap<String, String>> = row.try_get("attributes")?;
    Ok(ListingRecord {
        identity: identity_from_row(row)?,
        modified_at: row.try_get("modified_at")?,
        normalized_row_hash: row.try_get("normalized_row_hash")?,
        source_file_hash: row.try_get("source_file_hash")?,
        source_row_ordinal: to_u64(row.try_get("source_row_ordinal")?),
        expected_image_count: expected.and_then(|v| u32::try_from(v).ok()),
        lifecycle: lifecycle
            .map(|s| decode(s.parse::<ListingLifecycle>()))
            .transpose()?,
        attributes,
        staged_at: row.try_get("staged_at")?,
    })
}

fn quarantined_from_row(row: &PgRow) -> Result<QuarantinedRow, StoreError> {
    let reason: String = row.try_get("reason")?;
    Ok(QuarantinedRow {
        source_file_hash: row.try_get("source_file_hash")?,
        source_row_ordinal: to_u64(row.try_get("source_row_ordinal")?),
        raw_payload: row.try_get("raw_payload")?,
        reason: decode(reason.parse())?,
        detail: row.try_get("detail")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<ImageAsset, StoreError> {
    let source: String = row.try_get("source")?;
    let sequence: i32 = row.try_get("sequence_number")?;
    Ok(ImageAsset {
        identity: identity_from_row(row)?,
        content_hash: row.try_get("content_hash")?,
        original_filename: row.try_get("original_filename")?,
        sequence_number: u32::try_from(sequence).unwrap_or(0),
        byte_size: to_u64(row.try_get("byte_size")?),
        source: decode(source.parse::<ImageSource>())?,
        stored_path: row.try_get("stored_path")?,
        indexed_at: row.try_get("indexed_at")?,
        orphaned: row.try_get("orphaned")?,
    })
}

/// The stored status column is a denormalized copy; the value is always re-derived.
fn image_status_from_row(row: &PgRow) -> Result<ListingImageStatus, StoreError> {
    let count: i32 = row.try_get("images_count")?;
    let expected: Option<i32> = row.try_get("expected_count")?;
    Ok(ListingImageStatus::recompute(
        identity_from_row(row)?,
        u32::try_from(count).unwrap_or(0),
        expected.and_then(|v| u32::try_from(v).ok()),
        row.try_get("extraction_error")?,
        row.try_get("images_last_checked")?,
    ))
}

async fn insert_append_only(
    pool: &PgPool,
    table: &str,
    row: &QuarantinedRow,
) -> Result<bool, StoreError> {
    let sql = format!(
        "INSERT INTO {table} (source_file_hash, source_row_ordinal, reason, raw_payload, detail, recorded_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (source_file_hash, source_row_ordinal, reason) DO NOTHING"
    );
    let result = sqlx::query(&sql)
        .bind(&row.source_file_hash)
        .bind(to_i64(row.source_row_ordinal))
        .bind(row.reason.as_str())
        .bind(&row.raw_payload)
        .bind(&row.detail)
        .bind(row.recorded_at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn list_append_only(pool: &PgPool, table: &str) -> Result<Vec<QuarantinedRow>, StoreError> {
    let sql = format!(
        "SELECT source_file_hash, source_row_ordinal, reason, raw_payload, detail, recorded_at \
         FROM {table} ORDER BY recorded_at, source_file_hash, source_row_ordinal"
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(quarantined_from_row).collect()
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn record_discovery(
        &self,
        content_hash: &str,
        origin_path: &str,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO etl_ledger (content_hash, origin_path, discovered_at, status)
            VALUES ($1, $2, $3, 'discovered')
            ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(content_hash)
        .bind(origin_path)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE etl_ledger
               SET status = 'discovered',
                   origin_path = $2,
                   ingested_at = NULL,
                   error_detail = NULL,
                   rows_total = 0,
                   rows_clean = 0,
                   rows_quarantined = 0,
                   rows_conflicting = 0,
                   attempts = attempts + 1
             WHERE content_hash = $1
               AND status = 'failed'
            "#,
        )
        .bind(content_hash)
        .bind(origin_path)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM etl_ledger WHERE content_hash = $1"
        ))
        .bind(content_hash)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        ledger_from_row(&row)
    }

    async fn is_already_ingested(&self, content_hash: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT status FROM etl_ledger WHERE content_hash = $1")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let status: String = row.try_get("status")?;
        Ok(decode(status.parse::<FileStatus>())?.blocks_reprocessing())
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
        let updated = sqlx::query(&format!(
            r#"
            UPDATE etl_ledger
               SET status = $2,
                   rows_total = $3,
                   rows_clean = $4,
                   rows_quarantined = $5,
                   rows_conflicting = $6,
                   error_detail = $7,
                   ingested_at = $8
             WHERE content_hash = $1
               AND status = 'discovered'
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(content_hash)
        .bind(status.as_str())
        .bind(to_i64(counts.total))
        .bind(to_i64(counts.clean))
        .bind(to_i64(counts.quarantined))
        .bind(to_i64(counts.conflicting))
        .bind(error_detail.map(Json))
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return ledger_from_row(&row);
        }

        let existing = self
            .get_file(content_hash)
            .await?
            .ok_or_else(|| StoreError::UnknownFile(content_hash.to_string()))?;
        if existing.status == status {
            Ok(existing)
        } else {
            Err(StoreError::AlreadyFinalized {
                content_hash: content_hash.to_string(),
                existing: existing.status,
                requested: status,
            })
        }
    }

    async fn get_file(&self, content_hash: &str) -> Result<Option<IngestedFile>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM etl_ledger WHERE content_hash = $1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn list_files(&self) -> Result<Vec<IngestedFile>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM etl_ledger ORDER BY discovered_at, origin_path"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn upsert_listing(
        &self,
        row: &NormalizedRow,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO stage_listings (
                listing_key, domain, modified_at, normalized_row_hash, source_file_hash,
                source_row_ordinal, expected_image_count, lifecycle, attributes, staged_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (listing_key, domain) DO NOTHING
            "#,
        )
        .bind(&row.identity.listing_key)
        .bind(row.identity.domain.as_str())
        .bind(row.modified_at)
        .bind(&row.normalized_row_hash)
        .bind(&row.source_file_hash)
        .bind(to_i64(row.source_row_ordinal))
        .bind(row.expected_image_count.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(row.lifecycle.map(|l| l.as_str()))
        .bind(Json(&row.attributes))
        .bind(at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(UpsertOutcome::Inserted);
        }

        let current = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM stage_listings \
             WHERE listing_key = $1 AND domain = $2 FOR UPDATE"
        ))
        .bind(&row.identity.listing_key)
        .bind(row.identity.domain.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let existing = listing_from_row(&current)?;

        if row.modified_at <= existing.modified_at {
            tx.rollback().await?;
            return Ok(if row.normalized_row_hash == existing.normalized_row_hash {
                UpsertOutcome::Unchanged
            } else {
                UpsertOutcome::Conflict
            });
        }

        sqlx::query(
            r#"
            INSERT INTO stage_listing_history (listing_key, domain, record, superseded_at, superseded_by_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&existing.identity.listing_key)
        .bind(existing.identity.domain.as_str())
        .bind(Json(&existing))
        .bind(at)
        .bind(&row.normalized_row_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE stage_listings
               SET modified_at = $3,
                   normalized_row_hash = $4,
                   source_file_hash = $5,
                   source_row_ordinal = $6,
                   expected_image_count = $7,
                   lifecycle = $8,
                   attributes = $9,
                   staged_at = $10
             WHERE listing_key = $1 AND domain = $2
            "#,
        )
        .bind(&row.identity.listing_key)
        .bind(row.identity.domain.as_str())
        .bind(row.modified_at)
        .bind(&row.normalized_row_hash)
        .bind(&row.source_file_hash)
        .bind(to_i64(row.source_row_ordinal))
        .bind(row.expected_image_count.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(row.lifecycle.map(|l| l.as_str()))
        .bind(Json(&row.attributes))
        .bind(at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(UpsertOutcome::Replaced)
    }

    async fn get_listing(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM stage_listings WHERE listing_key = $1 AND domain = $2"
        ))
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn list_listings(&self) -> Result<Vec<ListingRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM stage_listings ORDER BY listing_key, domain"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut listings = rows
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        listings.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(listings)
    }

    async fn list_history(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Vec<ListingHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record, superseded_at, superseded_by_hash
              FROM stage_listing_history
             WHERE listing_key = $1 AND domain = $2
             ORDER BY id
            "#,
        )
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ListingHistoryEntry, StoreError> {
                let Json(record): Json<ListingRecord> = row.try_get("record")?;
                Ok(ListingHistoryEntry {
                    record,
                    superseded_at: row.try_get("superseded_at")?,
                    superseded_by_hash: row.try_get("superseded_by_hash")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl QuarantineSink for PgStore {
    async fn record_quarantine(&self, rows: &[QuarantinedRow]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for row in rows {
            if insert_append_only(&self.pool, "etl_quarantine", row).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        list_append_only(&self.pool, "etl_quarantine").await
    }
}

#[async_trait]
impl ConflictSink for PgStore {
    async fn record_conflict(&self, row: &QuarantinedRow) -> Result<bool, StoreError> {
        insert_append_only(&self.pool, "etl_conflicts", row).await
    }

    async fn list_conflicts(&self) -> Result<Vec<QuarantinedRow>, StoreError> {
        list_append_only(&self.pool, "etl_conflicts").await
    }
}

#[async_trait]
impl ImageAssetStore for PgStore {
    async fn has_image_asset(
        &self,
        identity: &ListingIdentity,
        content_hash: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM image_assets \
             WHERE listing_key = $1 AND domain = $2 AND content_hash = $3",
        )
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_image_asset(&self, asset: &ImageAsset) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO image_assets ({IMAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (listing_key, domain, content_hash) DO NOTHING"
        ))
        .bind(&asset.identity.listing_key)
        .bind(asset.identity.domain.as_str())
        .bind(&asset.content_hash)
        .bind(&asset.original_filename)
        .bind(i32::try_from(asset.sequence_number).unwrap_or(i32::MAX))
        .bind(to_i64(asset.byte_size))
        .bind(asset.source.as_str())
        .bind(&asset.stored_path)
        .bind(asset.indexed_at)
        .bind(asset.orphaned)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_image_assets(&self, identity: &ListingIdentity) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM image_assets WHERE listing_key = $1 AND domain = $2",
        )
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    async fn list_image_assets(&self) -> Result<Vec<ImageAsset>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {IMAGE_COLUMNS} FROM image_assets ORDER BY listing_key, domain, content_hash"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn put_image_status(&self, status: &ListingImageStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_image_status (
                listing_key, domain, images_count, expected_count, extraction_error,
                images_download_status, images_last_checked
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (listing_key, domain) DO UPDATE
            SET images_count = EXCLUDED.images_count,
                expected_count = EXCLUDED.expected_count,
                extraction_error = EXCLUDED.extraction_error,
                images_download_status = EXCLUDED.images_download_status,
                images_last_checked = EXCLUDED.images_last_checked
            "#,
        )
        .bind(&status.identity().listing_key)
        .bind(status.identity().domain.as_str())
        .bind(i32::try_from(status.images_count()).unwrap_or(i32::MAX))
        .bind(
            status
                .expected_count()
                .map(|v| i32::try_from(v).unwrap_or(i32::MAX)),
        )
        .bind(status.extraction_error())
        .bind(status.images_download_status().as_str())
        .bind(status.images_last_checked())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_image_status(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingImageStatus>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATUS_COLUMNS} FROM listing_image_status \
             WHERE listing_key = $1 AND domain = $2"
        ))
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(image_status_from_row).transpose()
    }

    async fn list_image_statuses(&self) -> Result<Vec<ListingImageStatus>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STATUS_COLUMNS} FROM listing_image_status ORDER BY listing_key, domain"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_status_from_row).collect()
    }

    async fn mark_orphaned(&self, identity: &ListingIdentity) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE image_assets SET orphaned = TRUE \
             WHERE listing_key = $1 AND domain = $2 AND orphaned = FALSE",
        )
        .bind(&identity.listing_key)
        .bind(identity.domain.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
