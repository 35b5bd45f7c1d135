use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    IngestDocument,
    ReEmbed,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Completed | TaskState::Failed
        )
    }

    pub fn valid_transitions(&self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            Queued => &[Running, Cancelled],
            Running => &[Paused, Cancelled, Completed, Failed, Queued],
            Paused => &[Running, Cancelled],
            Cancelled | Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// The stage graph fixed by spec §4.7: `Admit → Render → Ocr → Chunk →
/// Embed → Index → Finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Admit,
    Render,
    Ocr,
    Chunk,
    Embed,
    Index,
    Finalize,
}

impl StageName {
    pub const ORDER: [StageName; 7] = [
        StageName::Admit,
        StageName::Render,
        StageName::Ocr,
        StageName::Chunk,
        StageName::Embed,
        StageName::Index,
        StageName::Finalize,
    ];

    pub fn next(&self) -> Option<StageName> {
        let idx = Self::ORDER.iter().position(|s| s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

/// Durable `(version_id, stage_name, sub_index)` record used for
/// crash-safe resume (the glossary's "Stage cursor"). `sub_index`
/// addresses progress inside a stage, e.g. the page number reached
/// within the per-page OCR stage or the chunk offset reached within the
/// Embed stage's batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCursor {
    pub version_id: Uuid,
    pub stage: StageName,
    pub sub_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub target_version_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub state: TaskState,
    pub stage_cursor: Option<StageCursor>,
    pub attempt_count: u32,
    pub last_error: Option<crate::audit::ErrorSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Mirrors `cancel_requested` but for `pause(id)`: observed at the next
    /// checkpoint, after which the worker writes `state=paused` and
    /// releases the lease instead of continuing to the next stage.
    pub pause_requested: bool,
}

impl Task {
    pub const MAX_ATTEMPTS: u32 = 5;

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= Self::MAX_ATTEMPTS
    }
}
