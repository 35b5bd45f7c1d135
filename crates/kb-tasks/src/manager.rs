//! Public facade over task lifecycle operations (spec §4.8): `enqueue`,
//! `pause`, `resume`, `cancel`, `progress`, `list`. Callers (the pipeline
//! orchestrator, the daemon's HTTP handlers, `kb-cli`) talk to this, never
//! to `MetadataStore` or [`crate::queue::TaskQueue`] directly.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use kb_core::{Task, TaskKind, TaskState};
use kb_error::KbError;
use kb_metadata::{MetadataStore, TaskFilter};
use tracing::instrument;
use uuid::Uuid;

use crate::queue::{QueuePriority, QueuedTask, TaskQueue};

pub struct TaskManager {
    metadata: Arc<dyn MetadataStore>,
    /// In-process ordering hint only; `metadata` is the durable source of
    /// truth, so a full queue never blocks `enqueue` from persisting a
    /// task, it only loses the ordering hint for that entry (spec §5's
    /// "bounded queue, backpressure is advisory not authoritative").
    queue: Mutex<TaskQueue>,
}

impl TaskManager {
    pub fn new(metadata: Arc<dyn MetadataStore>, queue_capacity: usize) -> Self {
        TaskManager {
            metadata,
            queue: Mutex::new(TaskQueue::new(queue_capacity)),
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        target_version_id: Uuid,
        parent_task_id: Option<Uuid>,
        priority: QueuePriority,
    ) -> Result<Task, KbError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            kind,
            target_version_id,
            parent_task_id,
            state: TaskState::Queued,
            stage_cursor: None,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            lease_expires_at: None,
            cancel_requested: false,
            pause_requested: false,
        };
        self.metadata.create_task(task.clone()).await?;

        let hint = QueuedTask {
            task_id: task.id,
            kind: task.kind,
            priority,
            queued_at: now,
        };
        if let Err(err) = self.queue.lock().unwrap().enqueue(hint) {
            tracing::debug!(task_id = %task.id, error = %err, "queue ordering hint dropped, task remains durably queued");
        }
        Ok(task)
    }

    /// Sets `pause_requested`; honored at the worker's next checkpoint, not
    /// immediately (spec §4.8: "stops after the current stage step").
    #[instrument(level = "debug", skip(self))]
    pub async fn pause(&self, task_id: Uuid) -> Result<Task, KbError> {
        let mut task = self.metadata.get_task(task_id).await?;
        if task.state.is_terminal() {
            return Err(KbError::conflict(format!(
                "task {task_id} is already in terminal state {:?}",
                task.state
            )));
        }
        task.pause_requested = true;
        task.updated_at = Utc::now();
        self.metadata.update_task(task.clone()).await?;
        Ok(task)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn resume(&self, task_id: Uuid) -> Result<Task, KbError> {
        let mut task = self.metadata.get_task(task_id).await?;
        if task.state != TaskState::Paused {
            return Err(KbError::conflict(format!(
                "task {task_id} is not paused (state {:?})",
                task.state
            )));
        }
        task.state = TaskState::Queued;
        task.pause_requested = false;
        task.updated_at = Utc::now();
        self.metadata.update_task(task.clone()).await?;

        let hint = QueuedTask {
            task_id: task.id,
            kind: task.kind,
            priority: QueuePriority::default(),
            queued_at: task.updated_at,
        };
        let _ = self.queue.lock().unwrap().enqueue(hint);
        Ok(task)
    }

    /// Sets `cancel_requested`; a worker holding the lease observes it at
    /// its next checkpoint and transitions to `cancelled` itself rather
    /// than this call mutating `state` directly, so an in-flight write is
    /// never raced.
    #[instrument(level = "debug", skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task, KbError> {
        let mut task = self.metadata.get_task(task_id).await?;
        if task.state.is_terminal() {
            return Ok(task);
        }
        self.queue.lock().unwrap().remove(task_id);
        if task.state == TaskState::Queued {
            task.state = TaskState::Cancelled;
        } else {
            task.cancel_requested = true;
        }
        task.updated_at = Utc::now();
        self.metadata.update_task(task.clone()).await?;
        Ok(task)
    }

    pub async fn progress(&self, task_id: Uuid) -> Result<Task, KbError> {
        self.metadata.get_task(task_id).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, KbError> {
        self.metadata.list_tasks(filter).await
    }

    pub fn queue_stats(&self) -> crate::queue::QueueStats {
        self.queue.lock().unwrap().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_metadata::InMemoryMetadataStore;

    fn manager() -> TaskManager {
        TaskManager::new(Arc::new(InMemoryMetadataStore::new()), 16)
    }

    #[tokio::test]
    async fn enqueue_persists_a_queued_task() {
        let mgr = manager();
        let task = mgr
            .enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(mgr.queue_stats().total, 1);
    }

    #[tokio::test]
    async fn cancel_on_queued_task_is_immediate() {
        let mgr = manager();
        let task = mgr
            .enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();
        let cancelled = mgr.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);
        assert_eq!(mgr.queue_stats().total, 0);
    }

    #[tokio::test]
    async fn cancel_on_running_task_only_sets_the_request_flag() {
        let mgr = manager();
        let mut task = mgr
            .enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();
        task.state = TaskState::Running;
        mgr.metadata.update_task(task.clone()).await.unwrap();

        let updated = mgr.cancel(task.id).await.unwrap();
        assert_eq!(updated.state, TaskState::Running);
        assert!(updated.cancel_requested);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_through_queued() {
        let mgr = manager();
        let task = mgr
            .enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();

        let paused = mgr.pause(task.id).await.unwrap();
        assert!(paused.pause_requested);

        let mut reloaded = mgr.metadata.get_task(task.id).await.unwrap();
        reloaded.state = TaskState::Paused;
        mgr.metadata.update_task(reloaded).await.unwrap();

        let resumed = mgr.resume(task.id).await.unwrap();
        assert_eq!(resumed.state, TaskState::Queued);
        assert!(!resumed.pause_requested);
    }

    #[tokio::test]
    async fn resume_rejects_a_task_that_is_not_paused() {
        let mgr = manager();
        let task = mgr
            .enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();
        assert!(mgr.resume(task.id).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let mgr = manager();
        mgr.enqueue(TaskKind::IngestDocument, Uuid::new_v4(), None, QueuePriority::Normal)
            .await
            .unwrap();
        mgr.enqueue(TaskKind::Cleanup, Uuid::new_v4(), None, QueuePriority::Low)
            .await
            .unwrap();

        let ingest_only = mgr
            .list(TaskFilter { kind: Some(TaskKind::IngestDocument), state: None })
            .await
            .unwrap();
        assert_eq!(ingest_only.len(), 1);
    }
}
