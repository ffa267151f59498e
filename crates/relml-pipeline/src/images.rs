use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relml_core::policy::{decide_fetch, FetchCandidate, FetchDecision};
use relml_core::{
    Domain, ImageAsset, ImageSource, ImagesDownloadStatus, ListingIdentity, ListingImageStatus,
};
use relml_ingest::{domain_from_path, parse_image_filename, ImageBundle, ImageEntry};
use relml_storage::{sha1_hex, ImageAssetStore, ImageBlobStore, StagingStore, Store};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ImageStatusLine {
    pub listing_key: String,
    pub domain: Domain,
    pub images_count: u32,
    pub expected_count: Option<u32>,
    pub status: ImagesDownloadStatus,
}

impl From<&ListingImageStatus> for ImageStatusLine {
    fn from(status: &ListingImageStatus) -> Self {
        Self {
            listing_key: status.identity().listing_key.clone(),
            domain: status.identity().domain,
            images_count: status.images_count(),
            expected_count: status.expected_count(),
            status: status.images_download_status(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageBatchReport {
    pub run_id: Uuid,
    pub bundle: String,
    pub domain: Domain,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries_seen: u64,
    pub indexed: u64,
    pub duplicates: u64,
    pub unparseable: u64,
    pub read_errors: u64,
    pub orphans_marked: u64,
    pub statuses: Vec<ImageStatusLine>,
}

/// Indexes image bundles into hash-addressed blobs and per-listing status.
pub struct ImageIndexer<'a> {
    store: &'a dyn Store,
    blobs: ImageBlobStore,
    source: ImageSource,
}

impl<'a> ImageIndexer<'a> {
    pub fn new(store: &'a dyn Store, blobs: ImageBlobStore, source: ImageSource) -> Self {
        Self {
            store,
            blobs,
            source,
        }
    }

    /// Index a directory or zip archive. The domain defaults to the one named by the path.
    pub async fn index_bundle(
        &self,
        bundle: &Path,
        domain: Option<Domain>,
    ) -> Result<ImageBatchReport> {
        let domain = domain.or_else(|| domain_from_path(bundle)).with_context(|| {
            format!(
                "cannot infer SALE or RENTAL from {}; pass a domain explicitly",
                bundle.display()
            )
        })?;
        let entries = ImageBundle::open(bundle)
            .with_context(|| format!("opening image bundle {}", bundle.display()))?;
        let label = bundle.display().to_string();
        let span = info_span!("image_batch", bundle = %label, domain = %domain);
        self.index_entries(entries, domain, &label)
            .instrument(span)
            .await
    }

    pub async fn index_entries<I>(
        &self,
        entries: I,
        domain: Domain,
        label: &str,
    ) -> Result<ImageBatchReport>
    where
        I: IntoIterator<Item = ImageEntry>,
    {
        let started_at = Utc::now();
        let mut report = ImageBatchReport {
            run_id: Uuid::new_v4(),
            bundle: label.to_string(),
            domain,
            started_at,
            finished_at: started_at,
            entries_seen: 0,
            indexed: 0,
            duplicates: 0,
            unparseable: 0,
            read_errors: 0,
            orphans_marked: 0,
            statuses: Vec::new(),
        };
        // identity -> extraction error observed in this batch
        let mut touched: BTreeMap<ListingIdentity, bool> = BTreeMap::new();

        for entry in entries {
            report.entries_seen += 1;
            let parsed = parse_image_filename(&entry.name);
            let (name, bytes) = match (parsed, entry.data) {
                (Err(_), Err(read_err)) => {
                    warn!(entry = %entry.name, error = %read_err, "unreadable entry");
                    report.read_errors += 1;
                    continue;
                }
                (Err(parse_err), Ok(_)) => {
                    warn!(
                        entry = %entry.name,
                        error = %parse_err,
                        "skipping unparseable image filename"
                    );
                    report.unparseable += 1;
                    continue;
                }
                (Ok(name), Err(read_err)) => {
                    warn!(
                        entry = %entry.name,
                        error = %read_err,
                        "image entry could not be read"
                    );
                    report.read_errors += 1;
                    touched.insert(ListingIdentity::new(name.listing_key, domain), true);
                    continue;
                }
                (Ok(name), Ok(bytes)) => (name, bytes),
            };

            let identity = ListingIdentity::new(name.listing_key.clone(), domain);
            touched.entry(identity.clone()).or_insert(false);

            let content_hash = sha1_hex(&bytes);
            if self.store.has_image_asset(&identity, &content_hash).await? {
                report.duplicates += 1;
                continue;
            }
            let stored = self
                .blobs
                .store_bytes(&identity, &name.extension, &bytes)
                .await?;
            let asset = ImageAsset {
                identity: identity.clone(),
                content_hash: stored.content_hash.clone(),
                original_filename: entry.name.clone(),
                sequence_number: name.sequence_number,
                byte_size: bytes.len() as u64,
                source: self.source,
                stored_path: stored.relative_path.to_string_lossy().replace('\\', "/"),
                indexed_at: Utc::now(),
                orphaned: false,
            };
            if self.store.insert_image_asset(&asset).await? {
                report.indexed += 1;
            } else {
                report.duplicates += 1;
            }
        }

        let checked_at = Utc::now();
        for (identity, extraction_error) in &touched {
            let status = self
                .recompute_status(identity, *extraction_error, checked_at)
                .await?;
            report.statuses.push(ImageStatusLine::from(&status));
        }
        report.finished_at = Utc::now();

        info!(
            entries = report.entries_seen,
            indexed = report.indexed,
            duplicates = report.duplicates,
            unparseable = report.unparseable,
            read_errors = report.read_errors,
            listings = report.statuses.len(),
            "image batch indexed"
        );
        Ok(report)
    }

    /// Full recompute from the stored asset count and the staged expected count.
    pub async fn recompute_status(
        &self,
        identity: &ListingIdentity,
        extraction_error: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<ListingImageStatus> {
        let count = self.store.count_image_assets(identity).await?;
        let expected = self
            .store
            .get_listing(identity)
            .await?
            .and_then(|listing| listing.expected_image_count);
        let status = ListingImageStatus::recompute(
            identity.clone(),
            count,
            expected,
            extraction_error,
            checked_at,
        );
        self.store.put_image_status(&status).await?;
        Ok(status)
    }

    /// Soft-flag assets whose identity has no staged listing.
    pub async fn mark_orphans(&self) -> Result<u64> {
        let mut identities: Vec<ListingIdentity> = self
            .store
            .list_image_assets()
            .await?
            .into_iter()
            .filter(|asset| !asset.orphaned)
            .map(|asset| asset.identity)
            .collect();
        identities.dedup();

        let mut flagged = 0;
        for identity in identities {
            if self.store.get_listing(&identity).await?.is_none() {
                let marked = self.store.mark_orphaned(&identity).await?;
                if marked > 0 {
                    warn!(
                        listing = %identity,
                        assets = marked,
                        "no staged listing; images flagged as orphaned"
                    );
                }
                flagged += marked;
            }
        }
        Ok(flagged)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchPlanEntry {
    pub listing_key: String,
    pub domain: Domain,
    pub decision: FetchDecision,
}

/// Re-fetch advice for every staged listing with a known lifecycle. Listings without
/// recorded images count as `none`; a changed expected count is measured against the last
/// status recompute.
pub async fn fetch_plan(store: &dyn Store) -> Result<Vec<FetchPlanEntry>> {
    let mut plan = Vec::new();
    for listing in store.list_listings().await? {
        let Some(lifecycle) = listing.lifecycle else {
            continue;
        };
        let status = store.get_image_status(&listing.identity).await?;
        let candidate = FetchCandidate {
            lifecycle,
            image_status: status
                .as_ref()
                .map(|s| s.images_download_status())
                .unwrap_or(ImagesDownloadStatus::None),
            expected_changed: status
                .as_ref()
                .is_some_and(|s| s.expected_count() != listing.expected_image_count),
            late_active_change: false,
            catch_up_done: false,
        };
        plan.push(FetchPlanEntry {
            listing_key: listing.identity.listing_key.clone(),
            domain: listing.identity.domain,
            decision: decide_fetch(&candidate),
        });
    }
    Ok(plan)
}
