use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A lightweight, serializable copy of a failure, small enough to store
/// directly on `Task.last_error` without reaching back into `kb-error`'s
/// boxed-source form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub code: String,
    pub message: String,
}

/// Append-only record written by the Finalize stage and by
/// permission-mutating operations, giving the system an audit trail
/// without full event sourcing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub action: String,
    pub target: String,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(actor_user_id: Option<Uuid>, action: impl Into<String>, target: impl Into<String>) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            actor_user_id,
            action: action.into(),
            target: target.into(),
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
