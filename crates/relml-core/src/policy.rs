//! Advisory image re-fetch policy consumed by an external fetch scheduler.

use serde::{Deserialize, Serialize};

use crate::{ImagesDownloadStatus, ListingLifecycle};

/// What the scheduler knows about one listing when deciding whether to fetch images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCandidate {
    pub lifecycle: ListingLifecycle,
    pub image_status: ImagesDownloadStatus,
    /// Expected image count or album changed since the last check.
    pub expected_changed: bool,
    /// An update was missed while the listing was still active.
    pub late_active_change: bool,
    pub catch_up_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchReason {
    MissingImages,
    IncompleteImages,
    ExpectedCountChanged,
    LateActiveChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UpToDate,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum FetchDecision {
    Fetch(FetchReason),
    CatchUp(FetchReason),
    Skip(SkipReason),
}

impl FetchDecision {
    pub fn should_fetch(&self) -> bool {
        !matches!(self, FetchDecision::Skip(_))
    }
}

/// Active listings are refetched while incomplete; sold and leased listings get at most
/// one catch-up fetch when an active-period update was missed.
pub fn decide_fetch(candidate: &FetchCandidate) -> FetchDecision {
    match candidate.lifecycle {
        ListingLifecycle::Active => match candidate.image_status {
            ImagesDownloadStatus::None => FetchDecision::Fetch(FetchReason::MissingImages),
            ImagesDownloadStatus::Partial => FetchDecision::Fetch(FetchReason::IncompleteImages),
            ImagesDownloadStatus::Complete if candidate.expected_changed => {
                FetchDecision::Fetch(FetchReason::ExpectedCountChanged)
            }
            ImagesDownloadStatus::Complete => FetchDecision::Skip(SkipReason::UpToDate),
        },
        ListingLifecycle::Sold | ListingLifecycle::Leased => {
            if candidate.late_active_change && !candidate.catch_up_done {
                FetchDecision::CatchUp(FetchReason::LateActiveChange)
            } else {
                FetchDecision::Skip(SkipReason::Terminal)
            }
        }
    }
}
