//! Lease sweeper (spec §5): a crashed or killed worker stops heartbeating,
//! its task's lease expires, and this returns the task to `queued` with an
//! incremented attempt count so another worker can pick it up. `kb-metadata`
//! owns the actual compare-and-swap; this module is the named, loggable
//! entry point a daemon's background loop calls on a fixed interval.

use std::time::Duration;

use chrono::Utc;
use kb_error::KbError;
use kb_metadata::MetadataStore;
use tracing::{info, instrument};
use uuid::Uuid;

#[instrument(level = "debug", skip(metadata))]
pub async fn sweep_expired_leases(metadata: &dyn MetadataStore) -> Result<Vec<Uuid>, KbError> {
    let swept = metadata.sweep_expired_leases(Utc::now()).await?;
    if !swept.is_empty() {
        info!(count = swept.len(), task_ids = ?swept, "swept expired task leases");
    }
    Ok(swept)
}

/// Runs [`sweep_expired_leases`] on a fixed `interval` until the returned
/// handle is dropped or aborted. Intended for a daemon's startup sequence,
/// one call per process, independent of either worker pool.
pub fn spawn_sweeper(
    metadata: std::sync::Arc<dyn MetadataStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep_expired_leases(metadata.as_ref()).await {
                tracing::warn!(error = %err, "lease sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use kb_core::{StageCursor, StageName, Task, TaskKind, TaskState};
    use kb_metadata::InMemoryMetadataStore;
    use std::sync::Arc;

    fn running_task_with_expired_lease() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            kind: TaskKind::IngestDocument,
            target_version_id: Uuid::new_v4(),
            parent_task_id: None,
            state: TaskState::Running,
            stage_cursor: Some(StageCursor {
                version_id: Uuid::new_v4(),
                stage: StageName::Render,
                sub_index: 0,
            }),
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            lease_expires_at: Some(now - ChronoDuration::seconds(30)),
            cancel_requested: false,
            pause_requested: false,
        }
    }

    #[tokio::test]
    async fn sweeps_tasks_with_expired_leases_back_to_queued() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let task = running_task_with_expired_lease();
        let task_id = task.id;
        metadata.create_task(task).await.unwrap();

        let swept = sweep_expired_leases(metadata.as_ref()).await.unwrap();
        assert_eq!(swept, vec![task_id]);

        let reloaded = metadata.get_task(task_id).await.unwrap();
        assert_eq!(reloaded.state, TaskState::Queued);
        assert_eq!(reloaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn leaves_tasks_with_live_leases_alone() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let mut task = running_task_with_expired_lease();
        task.lease_expires_at = Some(Utc::now() + ChronoDuration::seconds(60));
        let task_id = task.id;
        metadata.create_task(task).await.unwrap();

        let swept = sweep_expired_leases(metadata.as_ref()).await.unwrap();
        assert!(swept.is_empty());
        assert_eq!(metadata.get_task(task_id).await.unwrap().state, TaskState::Running);
    }
}
