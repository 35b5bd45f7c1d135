//! Upload entry point (spec §6 `POST /upload`): the HTTP layer's only
//! pipeline dependency. Persists the raw bytes, writes the group/version
//! rows, and enqueues the `ingest_document` task C8 will schedule onto a
//! worker pool. Everything after that point happens in
//! [`crate::orchestrator::PipelineOrchestrator`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use kb_blob::BlobStore;
use kb_core::{DocumentGroup, DocumentVersion, ProcessingMode, Task, TaskKind, Visibility};
use kb_error::{ErrorCode, KbError};
use kb_metadata::MetadataStore;
use kb_render::FileKind;
use kb_tasks::{QueuePriority, TaskManager};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::stages;

/// One upload, already demultiplexed from its HTTP multipart form (or
/// from an archive's [`kb_render::ChildUpload`]) by the caller.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub owner_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub visibility: Visibility,
    pub processing_mode: ProcessingMode,
    pub ocr_engine: String,
    /// Set when this upload is an archive member; links the new task to
    /// the parent so `Finalize` can wait on every sibling (spec §4.7).
    pub parent_task_id: Option<Uuid>,
}

pub struct IngestOutcome {
    pub version: DocumentVersion,
    pub task: Task,
}

pub struct IngestService {
    blob: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    tasks: Arc<TaskManager>,
}

impl IngestService {
    pub fn new(blob: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>, tasks: Arc<TaskManager>) -> Self {
        IngestService { blob, metadata, tasks }
    }

    /// Stores the raw bytes under their content-addressed key, finds or
    /// creates the owning [`DocumentGroup`], creates the new `queued`
    /// [`DocumentVersion`], and enqueues its `ingest_document` task (I1:
    /// the checksum key means two byte-identical uploads share one blob,
    /// even though each still gets its own version row — the Admit stage
    /// is what actually short-circuits the rest of the graph).
    #[instrument(level = "info", skip(self, request), fields(filename = %request.filename))]
    pub async fn upload(&self, request: UploadRequest) -> Result<IngestOutcome, KbError> {
        let extension = request
            .filename
            .rsplit('.')
            .next()
            .filter(|ext| *ext != request.filename)
            .unwrap_or_default();
        let file_kind = FileKind::from_extension(extension).ok_or_else(|| {
            KbError::new(ErrorCode::UnsupportedFileType, format!("unrecognized file extension: {extension}"))
        })?;

        let checksum = stages::sha256_hex(&request.bytes);
        let storage_key = stages::raw_object_key(&checksum);
        self.blob
            .put("documents", &storage_key, request.bytes.clone(), "application/octet-stream")
            .await
            .map_err(KbError::from)?;

        let group = match self
            .metadata
            .find_group_by_filename_and_owner(&request.filename, request.owner_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let group = DocumentGroup {
                    group_id: Uuid::new_v4(),
                    canonical_filename: request.filename.clone(),
                    owner_id: request.owner_id,
                    org_id: request.org_id,
                };
                self.metadata.create_group(group.clone()).await?;
                group
            }
        };

        let version_number = self.metadata.list_versions_by_group(group.group_id).await?.len() as u32 + 1;
        let now = Utc::now();
        let version = DocumentVersion {
            id: Uuid::new_v4(),
            group_id: group.group_id,
            version_number,
            is_latest: false,
            checksum,
            file_type: extension.to_string(),
            file_size: request.bytes.len() as u64,
            storage_key,
            status: kb_core::VersionStatus::Queued,
            total_pages: 0,
            processed_pages: 0,
            progress_percent: 0.0,
            progress_message: None,
            created_at: now,
            updated_at: now,
            uploaded_by: request.owner_id,
            visibility: request.visibility,
            shared_user_ids: BTreeSet::new(),
            shared_role_codes: BTreeSet::new(),
            error_message: None,
            owner_id: request.owner_id,
            org_id: request.org_id,
            processing_mode: request.processing_mode,
            ocr_engine: request.ocr_engine,
            superseded: false,
        };
        self.metadata.create_version(version.clone()).await?;

        let task = self
            .tasks
            .enqueue(TaskKind::IngestDocument, version.id, request.parent_task_id, QueuePriority::Normal)
            .await?;

        info!(version_id = %version.id, task_id = %task.id, file_kind = ?file_kind, "upload accepted");
        Ok(IngestOutcome { version, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_blob::LocalBlobStore;
    use kb_metadata::InMemoryMetadataStore;

    fn service() -> (IngestService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blob: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()));
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let tasks = Arc::new(TaskManager::new(metadata.clone(), 64));
        (IngestService::new(blob, metadata, tasks), dir)
    }

    fn request(filename: &str, bytes: &[u8]) -> UploadRequest {
        UploadRequest {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            owner_id: Some(Uuid::new_v4()),
            org_id: None,
            visibility: Visibility::Private,
            processing_mode: ProcessingMode::Fast,
            ocr_engine: "mock-ocr".to_string(),
            parent_task_id: None,
        }
    }

    #[tokio::test]
    async fn upload_creates_a_queued_version_and_task() {
        let (service, _dir) = service();
        let outcome = service.upload(request("manual.pdf", b"one\x0ctwo")).await.unwrap();
        assert_eq!(outcome.version.version_number, 1);
        assert_eq!(outcome.version.status, kb_core::VersionStatus::Queued);
        assert_eq!(outcome.task.kind, TaskKind::IngestDocument);
        assert_eq!(outcome.task.target_version_id, outcome.version.id);
    }

    #[tokio::test]
    async fn second_upload_of_same_filename_bumps_version_number() {
        let (service, _dir) = service();
        let owner = Some(Uuid::new_v4());
        let mut req1 = request("manual.pdf", b"one");
        req1.owner_id = owner;
        let mut req2 = request("manual.pdf", b"two");
        req2.owner_id = owner;

        let first = service.upload(req1).await.unwrap();
        let second = service.upload(req2).await.unwrap();
        assert_eq!(first.version.group_id, second.version.group_id);
        assert_eq!(second.version.version_number, 2);
    }

    #[tokio::test]
    async fn unrecognized_extension_is_rejected_before_any_storage_write() {
        let (service, _dir) = service();
        let err = service.upload(request("payload.exe", b"x")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedFileType);
    }
}
