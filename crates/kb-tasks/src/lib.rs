//! Task queue, worker pools, leasing, sweeping and the pause/resume/cancel
//! lifecycle for the ingestion pipeline (spec §4.8, §5): a bounded
//! in-process queue feeding fixed-size worker pools, with durable state
//! and lease bookkeeping held in `kb-metadata` rather than in memory.

pub mod manager;
pub mod pool;
pub mod queue;
pub mod sweeper;

pub use manager::TaskManager;
pub use pool::{StageExecutor, WorkerPool, WorkerPoolConfig};
pub use queue::{QueueError, QueuePriority, QueueStats, QueuedTask, TaskQueue};
pub use sweeper::{spawn_sweeper, sweep_expired_leases};
