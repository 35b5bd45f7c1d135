//! The [`kb_tasks::StageExecutor`] that drives one task through the
//! stage graph in [`crate::stages`] one checkpoint at a time. `kb-tasks`
//! claims a task, calls [`PipelineOrchestrator::step`] exactly once, and
//! persists whatever `Task` comes back — it never re-queues on our
//! behalf, so every non-terminal return here must set `state` back to
//! `queued` itself for the next claim to pick up the following stage.

use std::sync::Arc;

use chrono::Utc;
use kb_blob::BlobStore;
use kb_config::OcrConfig;
use kb_core::chunk::ChunkMetadata;
use kb_core::{DocumentVersion, StageCursor, StageName, Task, TaskKind, TaskState, VersionStatus};
use kb_error::{ErrorCode, KbError, Severity};
use kb_index::IndexStore;
use kb_metadata::MetadataStore;
use kb_models::{EmbeddingClient, VlmClient};
use kb_render::{CapabilityRegistry, FileKind, OcrEngine};
use kb_tasks::StageExecutor;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::ingest::{IngestService, UploadRequest};
use crate::stages;

/// One `embed_batch`-sized slice of the version's chunks, per checkpoint
/// (spec §4.7 step 5's "batching within stage 5 groups consecutive
/// chunks").
const EMBED_CHECKPOINT_BATCH: usize = kb_models::EMBED_BATCH_CAP;

pub struct PipelineOrchestrator {
    blob: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    index: Arc<dyn IndexStore>,
    embedder: Arc<dyn EmbeddingClient>,
    vlm: Arc<dyn VlmClient>,
    ocr: Arc<dyn OcrEngine>,
    registry: CapabilityRegistry,
    ocr_config: OcrConfig,
    ingest: Arc<IngestService>,
}

impl PipelineOrchestrator {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        index: Arc<dyn IndexStore>,
        embedder: Arc<dyn EmbeddingClient>,
        vlm: Arc<dyn VlmClient>,
        ocr: Arc<dyn OcrEngine>,
        ocr_config: OcrConfig,
        ingest: Arc<IngestService>,
    ) -> Self {
        PipelineOrchestrator {
            blob,
            metadata,
            index,
            embedder,
            vlm,
            ocr,
            registry: CapabilityRegistry::new(),
            ocr_config,
            ingest,
        }
    }

    fn cursor_for(task: &Task, stage: StageName, sub_index: u32) -> StageCursor {
        StageCursor {
            version_id: task.target_version_id,
            stage,
            sub_index,
        }
    }

    /// PermanentInput/Permission/Invariant failures never retry (spec
    /// §7), so the version should already read `failed` the moment the
    /// task does, rather than waiting for the pool's own bookkeeping —
    /// a transient failure leaves the version `processing` until either
    /// a retry succeeds or the attempt cap is hit.
    async fn fail_version(&self, mut version: DocumentVersion, task: &Task, err: &KbError) -> Result<(), KbError> {
        let terminal = err.severity() != Severity::Transient || task.attempts_exhausted();
        if !terminal {
            return Ok(());
        }
        version.status = VersionStatus::Failed;
        version.error_message = Some(err.message.clone());
        version.updated_at = Utc::now();
        self.metadata.update_version(version).await
    }

    async fn chunk_metadata_for(&self, version: &DocumentVersion) -> Result<ChunkMetadata, KbError> {
        let group = self.metadata.get_group(version.group_id).await?;
        Ok(ChunkMetadata {
            document_id: version.group_id,
            owner_id: version.owner_id,
            org_id: version.org_id,
            visibility: version.visibility,
            shared_with_users: version.shared_user_ids.clone(),
            shared_with_roles: version.shared_role_codes.clone(),
            filename: group.canonical_filename,
            filepath: None,
            checksum: version.checksum.clone(),
            file_type: version.file_type.clone(),
            original_file_url: None,
            page_image_url: None,
        })
    }

    async fn step_admit(&self, task: &Task, mut version: DocumentVersion) -> Result<Task, KbError> {
        if version.status == VersionStatus::Queued {
            version.status = VersionStatus::Processing;
        }
        let bytes = self.blob.get("documents", &version.storage_key).await.map_err(KbError::from)?;
        let chunk_meta = self.chunk_metadata_for(&version).await?;
        let reused = stages::admit(
            self.metadata.as_ref(),
            self.index.as_ref(),
            &mut version,
            bytes.as_slice(),
            &chunk_meta,
        )
        .await?;
        self.metadata.update_version(version.clone()).await?;

        let next_stage = if reused { StageName::Finalize } else { StageName::Render };
        Ok(self.advance(task, next_stage, 0))
    }

    async fn step_render(&self, task: &Task, mut version: DocumentVersion) -> Result<Task, KbError> {
        let file_kind = FileKind::from_extension(&version.file_type).ok_or_else(|| {
            KbError::new(ErrorCode::UnsupportedFileType, format!("unrecognized file type: {}", version.file_type))
        })?;
        let bytes = self.blob.get("documents", &version.storage_key).await.map_err(KbError::from)?;
        let (children, pages) =
            stages::render(self.blob.as_ref(), &self.registry, &mut version, file_kind, bytes.as_slice()).await?;

        for page in &pages {
            let placeholder = kb_core::Page {
                document_version_id: version.id,
                page_number: page.page_number,
                image_key: kb_blob::page_image_key(version.id, page.page_number),
                ocr_json_key: None,
                text: page.native_text.clone().unwrap_or_default(),
                avg_confidence: 0.0,
                bboxes: page.native_bboxes.clone().unwrap_or_default(),
                vlm_failed: false,
            };
            self.metadata.put_page(placeholder).await?;
        }

        for child in children {
            let request = UploadRequest {
                filename: child.filename,
                bytes: child.bytes,
                owner_id: version.owner_id,
                org_id: version.org_id,
                visibility: version.visibility,
                processing_mode: version.processing_mode,
                ocr_engine: version.ocr_engine.clone(),
                parent_task_id: Some(task.id),
            };
            self.ingest.upload(request).await?;
        }

        self.metadata.update_version(version.clone()).await?;

        let next_stage = if version.total_pages == 0 {
            // Archive-only upload: no pages of its own, Finalize waits on children.
            StageName::Finalize
        } else {
            StageName::Ocr
        };
        Ok(self.advance(task, next_stage, 0))
    }

    async fn step_ocr(&self, task: &Task, mut version: DocumentVersion, page_index: u32) -> Result<Task, KbError> {
        let page_number = page_index + 1;
        let image_bytes = self
            .blob
            .get("documents", &kb_blob::page_image_key(version.id, page_number))
            .await
            .map_err(KbError::from)?;
        let native = self.metadata.get_page(version.id, page_number).await.ok();
        let native_text = native.as_ref().map(|p| p.text.as_str()).filter(|t| !t.trim().is_empty());

        let low_dpi = 150;
        let mut page = stages::ocr_page(
            self.ocr.as_ref(),
            &self.ocr_config,
            version.id,
            page_number,
            &image_bytes,
            native_text,
            low_dpi,
        )
        .await?;

        if version.processing_mode == kb_core::ProcessingMode::Deep {
            let needing_reocr = stages::spans_needing_reocr(&page.bboxes, self.ocr_config.deep_reocr_threshold);
            if !needing_reocr.is_empty() {
                let high_dpi = 600;
                page = stages::ocr_page(
                    self.ocr.as_ref(),
                    &self.ocr_config,
                    version.id,
                    page_number,
                    &image_bytes,
                    native_text,
                    high_dpi,
                )
                .await?;
            }
        }

        let correction = self.vlm.correct(&image_bytes, "Correct OCR transcription errors.").await;
        stages::apply_vlm_correction(&mut page, correction.map_err(Into::into));
        self.metadata.put_page(page).await?;

        let now = Utc::now();
        version.apply_progress(page_number, now);
        self.metadata.update_version(version.clone()).await?;

        if page_number >= version.total_pages {
            Ok(self.advance(task, StageName::Chunk, 0))
        } else {
            Ok(self.advance(task, StageName::Ocr, page_index + 1))
        }
    }

    async fn step_chunk(&self, task: &Task, version: DocumentVersion) -> Result<Task, KbError> {
        let pages = self.metadata.list_pages(version.id).await?;
        if pages.len() as u32 != version.total_pages {
            return Err(KbError::new(
                ErrorCode::InvariantViolation,
                format!("expected {} pages for version {}, found {}", version.total_pages, version.id, pages.len()),
            ));
        }
        // Chunking is a pure, deterministic recomputation of already-persisted
        // page text (spec §4.6); nothing needs to be written here, Embed
        // recomputes the same chunk list and checkpoints against the index.
        Ok(self.advance(task, StageName::Embed, 0))
    }

    async fn step_embed(&self, task: &Task, version: DocumentVersion, cursor_sub_index: u32) -> Result<Task, KbError> {
        let pages = self.metadata.list_pages(version.id).await?;
        let chunk_meta = self.chunk_metadata_for(&version).await?;
        let mut chunks = stages::chunk_pages(version.id, &pages, &chunk_meta);

        // The durable count of already-indexed chunks always wins over the
        // task's own cursor: a crash between `bulk_index` succeeding and the
        // task write landing must not re-embed and re-call C4 for work
        // already durable in C3 (spec §8 scenario 6).
        let already_indexed = self.index.chunk_ids_for_version(version.id).await.map_err(KbError::from)?.len() as u32;
        let start = cursor_sub_index.max(already_indexed) as usize;

        if start >= chunks.len() {
            return Ok(self.advance(task, StageName::Index, 0));
        }

        let end = (start + EMBED_CHECKPOINT_BATCH).min(chunks.len());
        let batch = &mut chunks[start..end];
        stages::embed_chunks(self.embedder.as_ref(), batch).await?;
        stages::index_chunks(self.index.as_ref(), batch.to_vec()).await?;

        let indexed_so_far = end as u32;
        if indexed_so_far >= chunks.len() as u32 {
            Ok(self.advance(task, StageName::Index, 0))
        } else {
            Ok(self.advance(task, StageName::Embed, indexed_so_far))
        }
    }

    async fn step_index(&self, task: &Task, _version: DocumentVersion) -> Result<Task, KbError> {
        // All real indexing work already happened per-batch inside `Embed`
        // (keeping an embedded-but-unindexed chunk batch alive across a
        // checkpoint boundary would mean re-calling C4 on resume); this
        // stage exists only so the visible stage graph still matches spec
        // §4.7's seven named stages.
        Ok(self.advance(task, StageName::Finalize, 0))
    }

    async fn step_finalize(&self, task: &Task, mut version: DocumentVersion) -> Result<Task, KbError> {
        let children = self.metadata.child_tasks(task.id).await?;
        if children.iter().any(|c| !c.state.is_terminal()) {
            // Busy-poll: stay parked on Finalize until every archive
            // member has reached a terminal state (spec §4.7 step 1's
            // archive-fan-out note, "a parent completes when all children
            // are terminal").
            return Ok(self.advance(task, StageName::Finalize, 0));
        }

        if version.total_pages == 0 && !children.is_empty() {
            // Archive container: no pages, no chunks of its own, its
            // "completion" is purely a function of its children.
            version.status = VersionStatus::Completed;
            version.processed_pages = 0;
            version.progress_percent = 100.0;
            version.updated_at = Utc::now();
            self.metadata.update_version(version.clone()).await?;
            self.metadata.promote_latest(version.group_id, version.id).await?;
        } else {
            stages::finalize(self.metadata.as_ref(), &mut version, version.uploaded_by).await?;
        }

        let mut completed = task.clone();
        completed.state = TaskState::Completed;
        completed.stage_cursor = Some(Self::cursor_for(task, StageName::Finalize, 0));
        completed.updated_at = Utc::now();
        Ok(completed)
    }

    async fn step_cleanup(&self, task: &Task) -> Result<Task, KbError> {
        let version = self.metadata.get_version(task.target_version_id).await?;
        self.metadata.delete_pages_for_version(version.id).await?;
        self.index.delete_by_version(version.id).await.map_err(KbError::from)?;
        self.blob.delete("documents", &version.storage_key).await.map_err(KbError::from)?;
        self.metadata.delete_version_row(version.id).await?;

        let mut completed = task.clone();
        completed.state = TaskState::Completed;
        completed.updated_at = Utc::now();
        Ok(completed)
    }

    fn advance(&self, task: &Task, stage: StageName, sub_index: u32) -> Task {
        let mut next = task.clone();
        next.stage_cursor = Some(Self::cursor_for(task, stage, sub_index));
        next.state = TaskState::Queued;
        next.updated_at = Utc::now();
        next
    }

    fn initial_cursor(kind: TaskKind) -> (StageName, u32) {
        match kind {
            TaskKind::IngestDocument => (StageName::Admit, 0),
            TaskKind::ReEmbed => (StageName::Chunk, 0),
            TaskKind::Cleanup => (StageName::Admit, 0),
        }
    }

    #[instrument(level = "debug", skip(self, task), fields(task_id = %task.id, kind = ?task.kind))]
    async fn step_inner(&self, task: &Task) -> Result<Task, KbError> {
        if task.kind == TaskKind::Cleanup {
            return self.step_cleanup(task).await;
        }

        let version = self.metadata.get_version(task.target_version_id).await?;
        let (stage, sub_index) = match task.stage_cursor {
            Some(cursor) => (cursor.stage, cursor.sub_index),
            None => Self::initial_cursor(task.kind),
        };

        match stage {
            StageName::Admit => self.step_admit(task, version).await,
            StageName::Render => self.step_render(task, version).await,
            StageName::Ocr => self.step_ocr(task, version, sub_index).await,
            StageName::Chunk => self.step_chunk(task, version).await,
            StageName::Embed => self.step_embed(task, version, sub_index).await,
            StageName::Index => self.step_index(task, version).await,
            StageName::Finalize => self.step_finalize(task, version).await,
        }
    }
}

#[async_trait::async_trait]
impl StageExecutor for PipelineOrchestrator {
    async fn step(&self, task: &Task) -> Result<Task, KbError> {
        match self.step_inner(task).await {
            Ok(updated) => Ok(updated),
            Err(err) => {
                if task.kind != TaskKind::Cleanup {
                    if let Ok(version) = self.metadata.get_version(task.target_version_id).await {
                        if let Err(e) = self.fail_version(version, task, &err).await {
                            warn!(task_id = %task.id, error = %e, "failed to persist version failure state");
                        }
                    }
                }
                info!(task_id = %task.id, error = %err, "stage step failed");
                Err(err)
            }
        }
    }
}
