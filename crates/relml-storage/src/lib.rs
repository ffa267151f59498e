//! Content hashing, hash-addressed image blobs, and the ledger/staging store contracts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relml_core::{
    ErrorDetail, FileStatus, ImageAsset, IngestedFile, ListingHistoryEntry, ListingIdentity,
    ListingImageStatus, ListingRecord, NormalizedRow, QuarantinedRow, RowCounts, UpsertOutcome,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "relml-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 160-bit digest used to identify image bytes.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stream a file through SHA-256 without loading it whole.
pub async fn sha256_file_hex(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger entry {content_hash} already finalized as {existing}, refusing {requested}")]
    AlreadyFinalized {
        content_hash: String,
        existing: FileStatus,
        requested: FileStatus,
    },
    #[error("ledger has no entry for {0}")]
    UnknownFile(String),
    #[error("{0} is not a terminal ledger status")]
    NonTerminalStatus(FileStatus),
    #[error("decoding stored value: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Single source of truth for "has this exact file been processed".
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a `discovered` entry or return the existing one. A `failed` entry is reopened.
    async fn record_discovery(
        &self,
        content_hash: &str,
        origin_path: &str,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError>;

    async fn is_already_ingested(&self, content_hash: &str) -> Result<bool, StoreError>;

    /// Move a `discovered` entry to a terminal status. Repeating the same status is a no-op;
    /// a different status yields [`StoreError::AlreadyFinalized`].
    async fn finalize(
        &self,
        content_hash: &str,
        status: FileStatus,
        counts: RowCounts,
        error_detail: Option<ErrorDetail>,
        at: DateTime<Utc>,
    ) -> Result<IngestedFile, StoreError>;

    async fn get_file(&self, content_hash: &str) -> Result<Option<IngestedFile>, StoreError>;

    async fn list_files(&self) -> Result<Vec<IngestedFile>, StoreError>;
}

/// Current-state listings keyed by `(listing_key, domain)` plus the append-only history.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Compare-and-swap scoped to one identity: later `modified_at` wins, equal content is a
    /// no-op, and a stale row with different content reports [`UpsertOutcome::Conflict`].
    async fn upsert_listing(
        &self,
        row: &NormalizedRow,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_listing(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingRecord>, StoreError>;

    /// Sorted by identity.
    async fn list_listings(&self) -> Result<Vec<ListingRecord>, StoreError>;

    async fn list_history(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Vec<ListingHistoryEntry>, StoreError>;
}

#[async_trait]
pub trait QuarantineSink: Send + Sync {
    /// Returns how many rows were new; duplicates by `(file, ordinal, reason)` are ignored.
    async fn record_quarantine(&self, rows: &[QuarantinedRow]) -> Result<u64, StoreError>;

    async fn list_quarantine(&self) -> Result<Vec<QuarantinedRow>, StoreError>;
}

#[async_trait]
pub trait ConflictSink: Send + Sync {
    async fn record_conflict(&self, row: &QuarantinedRow) -> Result<bool, StoreError>;

    async fn list_conflicts(&self) -> Result<Vec<QuarantinedRow>, StoreError>;
}

#[async_trait]
pub trait ImageAssetStore: Send + Sync {
    async fn has_image_asset(
        &self,
        identity: &ListingIdentity,
        content_hash: &str,
    ) -> Result<bool, StoreError>;

    /// Insert unless `(listing_key, domain, content_hash)` already exists.
    async fn insert_image_asset(&self, asset: &ImageAsset) -> Result<bool, StoreError>;

    async fn count_image_assets(&self, identity: &ListingIdentity) -> Result<u32, StoreError>;

    async fn list_image_assets(&self) -> Result<Vec<ImageAsset>, StoreError>;

    async fn put_image_status(&self, status: &ListingImageStatus) -> Result<(), StoreError>;

    async fn get_image_status(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<ListingImageStatus>, StoreError>;

    async fn list_image_statuses(&self) -> Result<Vec<ListingImageStatus>, StoreError>;

    /// Soft-flag every asset of `identity`; returns the number of newly flagged assets.
    async fn mark_orphaned(&self, identity: &ListingIdentity) -> Result<u64, StoreError>;
}

/// Everything the pipeline needs, passed explicitly into every processing call.
pub trait Store: LedgerStore + StagingStore + QuarantineSink + ConflictSink + ImageAssetStore {}

impl<T> Store for T where
    T: LedgerStore + StagingStore + QuarantineSink + ConflictSink + ImageAssetStore
{
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Image bytes stored immutably under `{DOMAIN}/{listing_key}/{sha1}.{ext}`.
#[derive(Debug, Clone)]
pub struct ImageBlobStore {
    root: PathBuf,
}

impl ImageBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_relative_path(
        &self,
        identity: &ListingIdentity,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim().to_ascii_lowercase();
        let ext = if ext.is_empty() { "bin".to_string() } else { ext };
        PathBuf::from(identity.domain.as_str())
            .join(sanitize_path_segment(&identity.listing_key))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        identity: &ListingIdentity,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredBlob> {
        let content_hash = sha1_hex(bytes);
        let relative_path = self.blob_relative_path(identity, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating image directory {}", parent.display()))?;

        let blob = |deduplicated: bool| StoredBlob {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking image path {}", absolute_path.display()))?
        {
            return Ok(blob(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp image file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp image file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp image file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(blob(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(blob(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp image {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn sanitize_path_segment(raw: &str) -> String {
    let cleaned = raw
        .trim()
        .replace(['/', '\\'], "_")
        .replace("..", "_")
        .trim_start_matches('.')
        .to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
