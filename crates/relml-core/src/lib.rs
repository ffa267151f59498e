//! Core domain model for the RELML listing and image ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod policy;

pub const CRATE_NAME: &str = "relml-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Listing market. Derived from the property type, never stored redundantly by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Domain {
    Sale,
    Rental,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Sale => "SALE",
            Domain::Rental => "RENTAL",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SALE" | "SALES" => Ok(Domain::Sale),
            "RENTAL" | "RENTALS" | "LEASE" | "LEASES" => Ok(Domain::Rental),
            _ => Err(ParseEnumError::new("domain", s)),
        }
    }
}

/// Composite identity of a listing in the current-state table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingIdentity {
    pub listing_key: String,
    pub domain: Domain,
}

impl ListingIdentity {
    pub fn new(listing_key: impl Into<String>, domain: Domain) -> Self {
        Self {
            listing_key: listing_key.into(),
            domain,
        }
    }
}

impl fmt::Display for ListingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.listing_key, self.domain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Ingested,
    Skipped,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Ingested => "ingested",
            FileStatus::Skipped => "skipped",
            FileStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileStatus::Discovered)
    }

    /// `failed` hashes stay eligible for retry; only these two short-circuit a rerun.
    pub fn blocks_reprocessing(&self) -> bool {
        matches!(self, FileStatus::Ingested | FileStatus::Skipped)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(FileStatus::Discovered),
            "ingested" => Ok(FileStatus::Ingested),
            "skipped" => Ok(FileStatus::Skipped),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(ParseEnumError::new("file status", s)),
        }
    }
}

/// Structured failure attached to a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowCounts {
    pub total: u64,
    pub clean: u64,
    pub quarantined: u64,
    pub conflicting: u64,
}

impl RowCounts {
    /// Every source row lands in exactly one of clean, quarantine or conflict.
    pub fn is_balanced(&self) -> bool {
        self.clean + self.quarantined + self.conflicting == self.total
    }

    pub fn add(&mut self, other: &RowCounts) {
        self.total += other.total;
        self.clean += other.clean;
        self.quarantined += other.quarantined;
        self.conflicting += other.conflicting;
    }
}

/// One source file known to the ledger, keyed by the digest of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedFile {
    pub content_hash: String,
    pub origin_path: String,
    pub discovered_at: DateTime<Utc>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub status: FileStatus,
    pub counts: RowCounts,
    pub error_detail: Option<ErrorDetail>,
    pub attempts: u32,
}

impl IngestedFile {
    pub fn discovered(
        content_hash: impl Into<String>,
        origin_path: impl Into<String>,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            origin_path: origin_path.into(),
            discovered_at,
            ingested_at: None,
            status: FileStatus::Discovered,
            counts: RowCounts::default(),
            error_detail: None,
            attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    BadQuote,
    ColumnMismatch,
    MissingRequiredCol,
    UnparseableFilename,
    IdentityMissing,
    InvalidZip,
    Other,
    ConflictingUpdate,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::BadQuote => "bad_quote",
            QuarantineReason::ColumnMismatch => "column_mismatch",
            QuarantineReason::MissingRequiredCol => "missing_required_col",
            QuarantineReason::UnparseableFilename => "unparseable_filename",
            QuarantineReason::IdentityMissing => "identity_missing",
            QuarantineReason::InvalidZip => "invalid_zip",
            QuarantineReason::Other => "other",
            QuarantineReason::ConflictingUpdate => "conflicting_update",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuarantineReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bad_quote" => Ok(QuarantineReason::BadQuote),
            "column_mismatch" => Ok(QuarantineReason::ColumnMismatch),
            "missing_required_col" => Ok(QuarantineReason::MissingRequiredCol),
            "unparseable_filename" => Ok(QuarantineReason::UnparseableFilename),
            "identity_missing" => Ok(QuarantineReason::IdentityMissing),
            "invalid_zip" => Ok(QuarantineReason::InvalidZip),
            "other" => Ok(QuarantineReason::Other),
            "conflicting_update" => Ok(QuarantineReason::ConflictingUpdate),
            _ => Err(ParseEnumError::new("quarantine reason", s)),
        }
    }
}

/// A row rejected before staging. Conflict rows share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRow {
    pub source_file_hash: String,
    pub source_row_ordinal: u64,
    pub raw_payload: String,
    pub reason: QuarantineReason,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl QuarantinedRow {
    pub fn dedup_key(&self) -> (String, u64, QuarantineReason) {
        (
            self.source_file_hash.clone(),
            self.source_row_ordinal,
            self.reason,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingLifecycle {
    Active,
    Sold,
    Leased,
}

impl ListingLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingLifecycle::Active => "active",
            ListingLifecycle::Sold => "sold",
            ListingLifecycle::Leased => "leased",
        }
    }

    /// Lenient mapping of MLS status codes; statuses outside the three states yield `None`.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "a" | "act" | "active" | "active option" | "option pending" | "pending"
            | "pend" | "p" => Some(ListingLifecycle::Active),
            "s" | "sld" | "sold" | "closed" | "cls" => Some(ListingLifecycle::Sold),
            "l" | "lsd" | "leased" | "rented" => Some(ListingLifecycle::Leased),
            _ => None,
        }
    }
}

impl FromStr for ListingLifecycle {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_lenient(s).ok_or_else(|| ParseEnumError::new("listing lifecycle", s))
    }
}

/// Validated, normalized row ready for the staging writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub identity: ListingIdentity,
    pub modified_at: DateTime<Utc>,
    pub normalized_row_hash: String,
    pub source_file_hash: String,
    pub source_row_ordinal: u64,
    pub raw_payload: String,
    pub expected_image_count: Option<u32>,
    pub lifecycle: Option<ListingLifecycle>,
    pub attributes: BTreeMap<String, String>,
}

/// Current-state snapshot of one listing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identity: ListingIdentity,
    pub modified_at: DateTime<Utc>,
    pub normalized_row_hash: String,
    pub source_file_hash: String,
    pub source_row_ordinal: u64,
    pub expected_image_count: Option<u32>,
    pub lifecycle: Option<ListingLifecycle>,
    pub attributes: BTreeMap<String, String>,
    pub staged_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn from_row(row: &NormalizedRow, staged_at: DateTime<Utc>) -> Self {
        Self {
            identity: row.identity.clone(),
            modified_at: row.modified_at,
            normalized_row_hash: row.normalized_row_hash.clone(),
            source_file_hash: row.source_file_hash.clone(),
            source_row_ordinal: row.source_row_ordinal,
            expected_image_count: row.expected_image_count,
            lifecycle: row.lifecycle,
            attributes: row.attributes.clone(),
            staged_at,
        }
    }
}

/// Superseded listing version kept in the append-only history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingHistoryEntry {
    pub record: ListingRecord,
    pub superseded_at: DateTime<Utc>,
    pub superseded_by_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Unchanged,
    Conflict,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Replaced => "replaced",
            UpsertOutcome::Unchanged => "unchanged",
            UpsertOutcome::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Manual,
    Automation,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Manual => "manual",
            ImageSource::Automation => "automation",
        }
    }
}

impl FromStr for ImageSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(ImageSource::Manual),
            "automation" | "auto" => Ok(ImageSource::Automation),
            _ => Err(ParseEnumError::new("image source", s)),
        }
    }
}

/// One indexed image, unique per `(listing_key, domain, content_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub identity: ListingIdentity,
    pub content_hash: String,
    pub original_filename: String,
    pub sequence_number: u32,
    pub byte_size: u64,
    pub source: ImageSource,
    pub stored_path: String,
    pub indexed_at: DateTime<Utc>,
    pub orphaned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagesDownloadStatus {
    None,
    Partial,
    Complete,
}

impl ImagesDownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagesDownloadStatus::None => "none",
            ImagesDownloadStatus::Partial => "partial",
            ImagesDownloadStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for ImagesDownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only writer of `images_download_status`.
pub fn derive_image_status(
    images_count: u32,
    expected_count: Option<u32>,
    extraction_error: bool,
) -> ImagesDownloadStatus {
    if images_count == 0 {
        return ImagesDownloadStatus::None;
    }
    if extraction_error {
        return ImagesDownloadStatus::Partial;
    }
    match expected_count {
        None | Some(0) => ImagesDownloadStatus::Complete,
        Some(expected) if images_count >= expected => ImagesDownloadStatus::Complete,
        Some(_) => ImagesDownloadStatus::Partial,
    }
}

/// Derived per-listing image completeness. Construct only through [`ListingImageStatus::recompute`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingImageStatus {
    identity: ListingIdentity,
    images_count: u32,
    expected_count: Option<u32>,
    extraction_error: bool,
    images_download_status: ImagesDownloadStatus,
    images_last_checked: DateTime<Utc>,
}

impl ListingImageStatus {
    pub fn recompute(
        identity: ListingIdentity,
        images_count: u32,
        expected_count: Option<u32>,
        extraction_error: bool,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            images_download_status: derive_image_status(
                images_count,
                expected_count,
                extraction_error,
            ),
            identity,
            images_count,
            expected_count,
            extraction_error,
            images_last_checked: checked_at,
        }
    }

    pub fn identity(&self) -> &ListingIdentity {
        &self.identity
    }

    pub fn images_count(&self) -> u32 {
        self.images_count
    }

    pub fn expected_count(&self) -> Option<u32> {
        self.expected_count
    }

    pub fn extraction_error(&self) -> bool {
        self.extraction_error
    }

    pub fn images_download_status(&self) -> ImagesDownloadStatus {
        self.images_download_status
    }

    pub fn images_last_checked(&self) -> DateTime<Utc> {
        self.images_last_checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_derivation_follows_counts() {
        assert_eq!(derive_image_status(0, Some(5), false), ImagesDownloadStatus::None);
        assert_eq!(derive_image_status(0, None, false), ImagesDownloadStatus::None);
        assert_eq!(derive_image_status(3, Some(5), false), ImagesDownloadStatus::Partial);
        assert_eq!(derive_image_status(5, Some(5), false), ImagesDownloadStatus::Complete);
        assert_eq!(derive_image_status(7, Some(5), false), ImagesDownloadStatus::Complete);
        assert_eq!(derive_image_status(1, Some(0), false), ImagesDownloadStatus::Complete);
        assert_eq!(derive_image_status(9, Some(0), false), ImagesDownloadStatus::Complete);
        assert_eq!(derive_image_status(2, None, false), ImagesDownloadStatus::Complete);
    }

    #[test]
    fn extraction_error_downgrades_to_partial() {
        assert_eq!(derive_image_status(5, Some(5), true), ImagesDownloadStatus::Partial);
        assert_eq!(derive_image_status(0, Some(5), true), ImagesDownloadStatus::None);
    }

    #[test]
    fn recompute_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let identity = ListingIdentity::new("K1", Domain::Sale);
        let a = ListingImageStatus::recompute(identity.clone(), 3, Some(5), false, at);
        let b = ListingImageStatus::recompute(identity, 3, Some(5), false, at);
        assert_eq!(a, b);
        assert_eq!(a.images_download_status(), ImagesDownloadStatus::Partial);
    }

    #[test]
    fn domain_parses_common_spellings() {
        assert_eq!("sale".parse::<Domain>().unwrap(), Domain::Sale);
        assert_eq!(" Rental ".parse::<Domain>().unwrap(), Domain::Rental);
        assert_eq!("LEASE".parse::<Domain>().unwrap(), Domain::Rental);
        assert!("land".parse::<Domain>().is_err());
    }

    #[test]
    fn enums_serialize_to_wire_names() {
        assert_eq!(serde_json::to_string(&Domain::Rental).unwrap(), "\"RENTAL\"");
        assert_eq!(
            serde_json::to_string(&QuarantineReason::MissingRequiredCol).unwrap(),
            "\"missing_required_col\""
        );
        assert_eq!(
            serde_json::to_string(&ImagesDownloadStatus::None).unwrap(),
            "\"none\""
        );
        for reason in [
            QuarantineReason::BadQuote,
            QuarantineReason::ColumnMismatch,
            QuarantineReason::IdentityMissing,
            QuarantineReason::ConflictingUpdate,
        ] {
            assert_eq!(reason.as_str().parse::<QuarantineReason>().unwrap(), reason);
        }
    }

    #[test]
    fn failed_files_remain_retryable() {
        assert!(FileStatus::Ingested.blocks_reprocessing());
        assert!(FileStatus::Skipped.blocks_reprocessing());
        assert!(!FileStatus::Failed.blocks_reprocessing());
        assert!(!FileStatus::Discovered.blocks_reprocessing());
        assert!(!FileStatus::Discovered.is_terminal());
    }

    #[test]
    fn lifecycle_maps_mls_codes() {
        assert_eq!(ListingLifecycle::parse_lenient("A"), Some(ListingLifecycle::Active));
        assert_eq!(ListingLifecycle::parse_lenient("Closed"), Some(ListingLifecycle::Sold));
        assert_eq!(ListingLifecycle::parse_lenient("leased"), Some(ListingLifecycle::Leased));
        assert_eq!(ListingLifecycle::parse_lenient("withdrawn"), None);
    }
}
