use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::role::RoleCode;

/// Logical identity shared across versions of the same document (the
/// glossary's "Group").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentGroup {
    pub group_id: Uuid,
    pub canonical_filename: String,
    pub owner_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl VersionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VersionStatus::Completed | VersionStatus::Failed | VersionStatus::Cancelled
        )
    }

    /// Legal forward transitions per the spec §3 lifecycle paragraph.
    pub fn can_transition_to(&self, next: VersionStatus) -> bool {
        use VersionStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Organization,
    Public,
}

impl Visibility {
    /// `private → organization → public` is the only allowed direction
    /// for owners/superusers per spec §4.9; a downgrade is a new share
    /// operation, not a transition, so it is always permitted by the
    /// caller who already holds mutate rights — this only documents the
    /// state machine's "freely allowed" direction.
    pub fn is_forward_transition_to(&self, next: Visibility) -> bool {
        next >= *self
    }
}

/// Per-upload OCR policy (spec §6 `/upload` form fields, §4.7 step 3);
/// carried on the version rather than the task so a re-embed/retry can
/// still see how the version was meant to be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// One OCR pass, VLM correction runs in parallel with the next page.
    Fast,
    /// Two-pass adaptive OCR: low-DPI pass, layout sort, higher-DPI
    /// re-pass on low-confidence regions, then VLM correction.
    Deep,
}

impl Default for ProcessingMode {
    fn default() -> Self {
        ProcessingMode::Fast
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub id: Uuid,
    pub group_id: Uuid,
    pub version_number: u32,
    pub is_latest: bool,
    pub checksum: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_key: String,
    pub status: VersionStatus,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub progress_percent: f32,
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub uploaded_by: Option<Uuid>,
    pub visibility: Visibility,
    pub shared_user_ids: BTreeSet<Uuid>,
    pub shared_role_codes: BTreeSet<RoleCode>,
    pub error_message: Option<String>,
    pub owner_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub processing_mode: ProcessingMode,
    pub ocr_engine: String,
    /// Set by a soft [`kb-versions`] delete (spec §4.11: "hard=false
    /// marks superseded"). Orthogonal to `status`/`is_latest`: a
    /// superseded version keeps its rows and chunks but is excluded from
    /// normal document listings.
    pub superseded: bool,
}

impl DocumentVersion {
    /// (I3) progress must never move backwards until the version reaches
    /// a terminal state.
    pub fn apply_progress(&mut self, processed_pages: u32, now: DateTime<Utc>) {
        debug_assert!(processed_pages <= self.total_pages.max(processed_pages));
        if self.status.is_terminal() {
            return;
        }
        self.processed_pages = self.processed_pages.max(processed_pages);
        self.progress_percent = if self.total_pages == 0 {
            self.progress_percent
        } else {
            (self.processed_pages as f32 / self.total_pages as f32 * 100.0)
                .max(self.progress_percent)
        };
        self.updated_at = now;
    }
}
