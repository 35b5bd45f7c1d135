//! Pipeline Stages (C7): the stage graph `Admit → Render → Ocr → Chunk →
//! Embed → Index → Finalize` (spec §4.7). [`stages`] holds one
//! checkpointed async function per stage; [`orchestrator::PipelineOrchestrator`]
//! is the [`kb_tasks::StageExecutor`] that walks a task through them one
//! checkpoint per call, and [`ingest::IngestService`] is the public upload
//! entry point that creates the group/version/task triple C8 schedules.

pub mod ingest;
pub mod orchestrator;
pub mod stages;

pub use ingest::{IngestService, UploadRequest};
pub use orchestrator::PipelineOrchestrator;
