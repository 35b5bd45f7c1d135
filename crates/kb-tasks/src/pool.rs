//! Worker pools (spec §5): a named, fixed-size pool of long-lived workers,
//! each pulling one claimable task from `kb-metadata`, running it to its
//! next checkpoint, persisting the cursor, then releasing. Two instances
//! are configured in `kb-config`'s `WorkerPoolConfig` (`cpu_pool` for
//! render/OCR/chunk, `model_pool` for embed/VLM), per spec §5.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kb_core::audit::ErrorSnapshot;
use kb_core::{Task, TaskKind, TaskState};
use kb_error::{KbError, Severity};
use kb_metadata::MetadataStore;
use kb_retry::RetryPolicy;
use tokio::sync::Notify;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Runs exactly one checkpointed step of a claimed task. Implemented by
/// `kb-pipeline`'s stage graph; `kb-tasks` only knows how to claim, lease,
/// retry and persist, never what a step actually does.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Returns the task with `stage_cursor`/`state` advanced as far as one
    /// checkpoint allows. `Err` carries the failure for the pool to
    /// classify via [`kb_error::ErrorCode::severity`].
    async fn step(&self, task: &Task) -> Result<Task, KbError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: StdDuration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            concurrency: 4,
            lease_ttl: Duration::seconds(60),
            heartbeat_interval: StdDuration::from_secs(10),
        }
    }
}

/// One named pool (`cpu_pool` or `model_pool`); `kind_filter` restricts
/// which `TaskKind`s this pool's `claim_next_task` call is eligible for,
/// so the two pools never compete for the same work.
pub struct WorkerPool {
    pub name: String,
    config: WorkerPoolConfig,
    kind_filter: Vec<TaskKind>,
    metadata: Arc<dyn MetadataStore>,
    retry_policy: RetryPolicy,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        config: WorkerPoolConfig,
        kind_filter: Vec<TaskKind>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        WorkerPool {
            name: name.into(),
            config,
            kind_filter,
            metadata,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Claims and fully executes one task through `executor`, handling the
    /// cooperative cancel/pause checkpoints, lease heartbeating, and the
    /// attempt-cap retry policy. Returns `Ok(false)` if nothing was
    /// claimable. This is the unit a production worker loop calls
    /// repeatedly; `kb-tasks` does not itself own the `loop { }`, so tests
    /// stay deterministic.
    #[instrument(level = "debug", skip(self, executor), fields(pool = %self.name))]
    pub async fn run_once(&self, executor: &dyn StageExecutor) -> Result<bool, KbError> {
        let now = Utc::now();
        let task = match self
            .metadata
            .claim_next_task(&self.kind_filter, self.config.lease_ttl, now)
            .await?
        {
            Some(t) => t,
            None => return Ok(false),
        };

        if task.cancel_requested {
            self.finish_as(task, TaskState::Cancelled, None).await?;
            return Ok(true);
        }
        if task.pause_requested {
            self.finish_as(task, TaskState::Paused, None).await?;
            return Ok(true);
        }

        let heartbeat = self.spawn_heartbeat(task.id);
        let outcome = executor.step(&task).await;
        heartbeat.stop();

        match outcome {
            Ok(updated) => {
                self.metadata.update_task(updated).await?;
            }
            Err(err) => self.handle_failure(task, err).await?,
        }
        Ok(true)
    }

    async fn handle_failure(&self, mut task: Task, err: KbError) -> Result<(), KbError> {
        let snapshot = ErrorSnapshot {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
        };
        task.last_error = Some(snapshot);
        task.updated_at = Utc::now();

        match err.severity() {
            Severity::Cancellation => {
                task.state = TaskState::Cancelled;
                self.metadata.update_task(task).await?;
            }
            Severity::Transient if !task.attempts_exhausted() => {
                let delay = self.retry_policy.delay_for_attempt(task.attempt_count);
                warn!(task_id = %task.id, attempt = task.attempt_count, delay_ms = delay.as_millis() as u64, "retrying task after transient failure");
                task.attempt_count += 1;
                task.state = TaskState::Queued;
                task.lease_expires_at = None;
                tokio::time::sleep(delay).await;
                self.metadata.update_task(task).await?;
            }
            _ => {
                task.state = TaskState::Failed;
                self.metadata.update_task(task).await?;
            }
        }
        Ok(())
    }

    async fn finish_as(&self, mut task: Task, state: TaskState, error: Option<ErrorSnapshot>) -> Result<(), KbError> {
        task.state = state;
        task.updated_at = Utc::now();
        task.last_error = error;
        self.metadata.update_task(task).await
    }

    fn spawn_heartbeat(&self, task_id: Uuid) -> HeartbeatHandle {
        let metadata = self.metadata.clone();
        let interval = self.config.heartbeat_interval;
        let lease_ttl = self.config.lease_ttl;
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = extend_lease(metadata.as_ref(), task_id, lease_ttl).await {
                            warn!(task_id = %task_id, error = %e, "heartbeat failed to extend lease");
                        }
                    }
                    _ = stop_signal.notified() => break,
                }
            }
        });
        HeartbeatHandle { stop, handle: Some(handle) }
    }
}

async fn extend_lease(metadata: &dyn MetadataStore, task_id: Uuid, lease_ttl: Duration) -> Result<(), KbError> {
    let mut task = metadata.get_task(task_id).await?;
    if task.state != TaskState::Running {
        return Ok(());
    }
    task.lease_expires_at = Some(Utc::now() + lease_ttl);
    metadata.update_task(task).await
}

struct HeartbeatHandle {
    stop: Arc<Notify>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatHandle {
    fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::{StageCursor, StageName};
    use kb_metadata::InMemoryMetadataStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample_task(kind: TaskKind) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            kind,
            target_version_id: Uuid::new_v4(),
            parent_task_id: None,
            state: TaskState::Queued,
            stage_cursor: Some(StageCursor {
                version_id: Uuid::new_v4(),
                stage: StageName::Admit,
                sub_index: 0,
            }),
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            lease_expires_at: None,
            cancel_requested: false,
            pause_requested: false,
        }
    }

    struct AlwaysAdvance;

    #[async_trait]
    impl StageExecutor for AlwaysAdvance {
        async fn step(&self, task: &Task) -> Result<Task, KbError> {
            let mut next = task.clone();
            next.state = TaskState::Completed;
            Ok(next)
        }
    }

    struct AlwaysFail(kb_error::ErrorCode);

    #[async_trait]
    impl StageExecutor for AlwaysFail {
        async fn step(&self, _task: &Task) -> Result<Task, KbError> {
            Err(KbError::new(self.0, "synthetic failure"))
        }
    }

    struct CountingExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageExecutor for CountingExecutor {
        async fn step(&self, task: &Task) -> Result<Task, KbError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut next = task.clone();
            next.state = TaskState::Completed;
            Ok(next)
        }
    }

    async fn pool_with_task(task: Task) -> (WorkerPool, Arc<dyn MetadataStore>, Uuid) {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let task_id = task.id;
        metadata.create_task(task.clone()).await.unwrap();
        let pool = WorkerPool::new(
            "cpu_pool",
            WorkerPoolConfig::default(),
            vec![task.kind],
            metadata.clone(),
        );
        (pool, metadata, task_id)
    }

    #[tokio::test]
    async fn claims_and_completes_a_task() {
        let (pool, metadata, task_id) = pool_with_task(sample_task(TaskKind::IngestDocument)).await;
        let processed = pool.run_once(&AlwaysAdvance).await.unwrap();
        assert!(processed);
        let task = metadata.get_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn empty_queue_returns_false() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let pool = WorkerPool::new(
            "cpu_pool",
            WorkerPoolConfig::default(),
            vec![TaskKind::IngestDocument],
            metadata,
        );
        assert!(!pool.run_once(&AlwaysAdvance).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_requested_is_honored_before_execution() {
        let mut task = sample_task(TaskKind::IngestDocument);
        task.cancel_requested = true;
        let (pool, metadata, task_id) = pool_with_task(task).await;
        let counter = CountingExecutor { calls: AtomicU32::new(0) };
        pool.run_once(&counter).await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metadata.get_task(task_id).await.unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn pause_requested_is_honored_before_execution() {
        let mut task = sample_task(TaskKind::IngestDocument);
        task.pause_requested = true;
        let (pool, metadata, task_id) = pool_with_task(task).await;
        pool.run_once(&AlwaysAdvance).await.unwrap();
        assert_eq!(metadata.get_task(task_id).await.unwrap().state, TaskState::Paused);
    }

    #[tokio::test]
    async fn permanent_input_failure_does_not_retry() {
        let (pool, metadata, task_id) = pool_with_task(sample_task(TaskKind::IngestDocument)).await;
        pool.run_once(&AlwaysFail(kb_error::ErrorCode::UnsupportedFileType)).await.unwrap();
        let task = metadata.get_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_until_attempt_cap() {
        let (pool, metadata, task_id) = pool_with_task(sample_task(TaskKind::IngestDocument)).await;

        for expected_attempt in 0..Task::MAX_ATTEMPTS {
            pool.run_once(&AlwaysFail(kb_error::ErrorCode::Timeout)).await.unwrap();
            let task = metadata.get_task(task_id).await.unwrap();
            if expected_attempt + 1 < Task::MAX_ATTEMPTS {
                assert_eq!(task.state, TaskState::Queued);
                assert_eq!(task.attempt_count, expected_attempt + 1);
            } else {
                assert_eq!(task.state, TaskState::Failed);
            }
        }
    }

    #[tokio::test]
    async fn cancellation_severity_marks_cancelled_not_failed() {
        let (pool, metadata, task_id) = pool_with_task(sample_task(TaskKind::IngestDocument)).await;
        pool.run_once(&AlwaysFail(kb_error::ErrorCode::Cancelled)).await.unwrap();
        let task = metadata.get_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
    }
}
