//! Version Manager (C11): `promote_latest`, `restore`, and soft/hard
//! `delete_version` exactly as specified in `spec.md` §4.11, operating
//! against `kb-metadata`, `kb-blob`, and `kb-index`.

use std::sync::Arc;

use chrono::Utc;
use kb_blob::{page_image_key, page_ocr_key, raw_key, BlobStore};
use kb_core::VersionStatus;
use kb_error::KbError;
use kb_index::IndexStore;
use kb_metadata::MetadataStore;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct VersionManager {
    metadata: Arc<dyn MetadataStore>,
    blob: Arc<dyn BlobStore>,
    index: Arc<dyn IndexStore>,
}

impl VersionManager {
    pub fn new(metadata: Arc<dyn MetadataStore>, blob: Arc<dyn BlobStore>, index: Arc<dyn IndexStore>) -> Self {
        VersionManager { metadata, blob, index }
    }

    /// On completion of version `v` in group `g`: flips `is_latest` to
    /// `v` and clears it on every other version of `g` in one C2
    /// transaction (`MetadataStore::promote_latest` already does the
    /// multi-row mutation atomically).
    #[instrument(level = "info", skip(self))]
    pub async fn promote_latest(&self, group_id: Uuid, version_id: Uuid) -> Result<(), KbError> {
        self.metadata.promote_latest(group_id, version_id).await?;
        info!(%group_id, %version_id, "promoted to latest");
        Ok(())
    }

    /// Marks `v` latest without reprocessing. Chunk records are
    /// untouched since per-chunk visibility does not depend on which
    /// version is latest.
    #[instrument(level = "info", skip(self))]
    pub async fn restore(&self, group_id: Uuid, version_id: Uuid) -> Result<(), KbError> {
        let mut version = self.metadata.get_version(version_id).await?;
        if version.group_id != group_id {
            return Err(KbError::not_found("version does not belong to group"));
        }
        version.superseded = false;
        version.updated_at = Utc::now();
        self.metadata.update_version(version).await?;
        self.metadata.promote_latest(group_id, version_id).await?;
        info!(%group_id, %version_id, "restored");
        Ok(())
    }

    /// `hard = false`: marks the version superseded, leaving blobs,
    /// chunks, and the metadata row intact. `hard = true`: removes its
    /// blobs, its chunks in C3 (by `version_id`), and its metadata row;
    /// if it was latest and other versions of the group remain, promotes
    /// the one with the highest `version_number`.
    #[instrument(level = "info", skip(self))]
    pub async fn delete_version(&self, group_id: Uuid, version_id: Uuid, hard: bool) -> Result<(), KbError> {
        let version = self.metadata.get_version(version_id).await?;
        if version.group_id != group_id {
            return Err(KbError::not_found("version does not belong to group"));
        }

        if !hard {
            let mut version = version;
            version.superseded = true;
            version.updated_at = Utc::now();
            self.metadata.update_version(version).await?;
            info!(%group_id, %version_id, "soft-deleted (superseded)");
            return Ok(());
        }

        self.index.delete_by_version(version_id).await.map_err(KbError::from)?;
        for page in self.metadata.list_pages(version_id).await? {
            let _ = self.blob.delete("pages", &page_image_key(version_id, page.page_number)).await;
            let _ = self.blob.delete("pages", &page_ocr_key(version_id, page.page_number)).await;
        }
        self.metadata.delete_pages_for_version(version_id).await?;

        let sibling_versions = self.metadata.list_versions_by_group(group_id).await?;
        let other_completed: Vec<_> = sibling_versions
            .iter()
            .filter(|v| v.id != version_id && v.status == VersionStatus::Completed)
            .collect();

        // Only delete the raw blob if no sibling version shares its
        // content-addressed checksum (I1: duplicate uploads reuse storage).
        let shares_checksum = sibling_versions.iter().any(|v| v.id != version_id && v.checksum == version.checksum);
        if !shares_checksum {
            let _ = self.blob.delete("documents", &raw_key(&version.checksum)).await;
        }

        self.metadata.delete_version_row(version_id).await?;

        if version.is_latest {
            if let Some(next) = other_completed.iter().max_by_key(|v| v.version_number) {
                self.metadata.promote_latest(group_id, next.id).await?;
            }
        }

        info!(%group_id, %version_id, "hard-deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kb_core::chunk::ChunkMetadata;
    use kb_core::document::Visibility;
    use kb_core::{Chunk, DocumentGroup, DocumentVersion, ProcessingMode};
    use kb_index::InMemoryIndexStore;
    use kb_metadata::InMemoryMetadataStore;
    use std::collections::BTreeSet;

    fn version(group_id: Uuid, n: u32, latest: bool, checksum: &str) -> DocumentVersion {
        let now = Utc::now();
        DocumentVersion {
            id: Uuid::new_v4(),
            group_id,
            version_number: n,
            is_latest: latest,
            checksum: checksum.to_string(),
            file_type: "pdf".to_string(),
            file_size: 10,
            storage_key: raw_key(checksum),
            status: VersionStatus::Completed,
            total_pages: 1,
            processed_pages: 1,
            progress_percent: 100.0,
            progress_message: None,
            created_at: now,
            updated_at: now,
            uploaded_by: None,
            visibility: Visibility::Private,
            shared_user_ids: BTreeSet::new(),
            shared_role_codes: BTreeSet::new(),
            error_message: None,
            owner_id: None,
            org_id: None,
            processing_mode: ProcessingMode::Fast,
            ocr_engine: "mock-ocr".to_string(),
            superseded: false,
        }
    }

    async fn harness() -> (VersionManager, Arc<dyn MetadataStore>, Arc<dyn IndexStore>, Arc<dyn BlobStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let index: Arc<dyn IndexStore> = Arc::new(InMemoryIndexStore::new());
        let blob: Arc<dyn BlobStore> = Arc::new(kb_blob::LocalBlobStore::new(dir.path()));
        let manager = VersionManager::new(metadata.clone(), blob.clone(), index.clone());
        (manager, metadata, index, blob, dir)
    }

    #[tokio::test]
    async fn restore_marks_latest_without_touching_chunks() {
        let (manager, metadata, index, _blob, _dir) = harness().await;
        let group_id = Uuid::new_v4();
        metadata
            .create_group(DocumentGroup { group_id, canonical_filename: "m.pdf".into(), owner_id: None, org_id: None })
            .await
            .unwrap();
        let v1 = version(group_id, 1, false, "sum1");
        let v2 = version(group_id, 2, true, "sum2");
        metadata.create_version(v1.clone()).await.unwrap();
        metadata.create_version(v2.clone()).await.unwrap();

        let chunk = Chunk {
            chunk_id: "c1".into(),
            version_id: v1.id,
            page_number: 1,
            local_index: 0,
            text: "body".into(),
            vector: None,
            metadata: ChunkMetadata {
                document_id: v1.id,
                owner_id: None,
                org_id: None,
                visibility: Visibility::Private,
                shared_with_users: BTreeSet::new(),
                shared_with_roles: BTreeSet::new(),
                filename: "m.pdf".into(),
                filepath: None,
                checksum: "sum1".into(),
                file_type: "pdf".into(),
                original_file_url: None,
                page_image_url: None,
            },
        };
        index.bulk_index(vec![chunk], Utc::now()).await.unwrap();

        manager.restore(group_id, v1.id).await.unwrap();
        let reloaded_v1 = metadata.get_version(v1.id).await.unwrap();
        let reloaded_v2 = metadata.get_version(v2.id).await.unwrap();
        assert!(reloaded_v1.is_latest);
        assert!(!reloaded_v2.is_latest);
        assert_eq!(index.chunk_ids_for_version(v1.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn soft_delete_marks_superseded_and_keeps_rows() {
        let (manager, metadata, _index, _blob, _dir) = harness().await;
        let group_id = Uuid::new_v4();
        let v = version(group_id, 1, true, "sum1");
        metadata.create_version(v.clone()).await.unwrap();

        manager.delete_version(group_id, v.id, false).await.unwrap();
        let reloaded = metadata.get_version(v.id).await.unwrap();
        assert!(reloaded.superseded);
    }

    #[tokio::test]
    async fn hard_delete_of_latest_promotes_next_highest_version() {
        let (manager, metadata, index, blob, _dir) = harness().await;
        let group_id = Uuid::new_v4();
        let v1 = version(group_id, 1, false, "sum1");
        let mut v2 = version(group_id, 2, true, "sum2");
        v2.is_latest = true;
        metadata.create_version(v1.clone()).await.unwrap();
        metadata.create_version(v2.clone()).await.unwrap();
        blob.put("documents", &raw_key("sum2"), b"bytes".to_vec(), "application/octet-stream").await.unwrap();

        manager.delete_version(group_id, v2.id, true).await.unwrap();

        assert!(metadata.get_version(v2.id).await.is_err());
        let promoted = metadata.get_version(v1.id).await.unwrap();
        assert!(promoted.is_latest);
        assert_eq!(index.chunk_ids_for_version(v2.id).await.unwrap().len(), 0);
        assert!(blob.get("documents", &raw_key("sum2")).await.is_err());
    }

    #[tokio::test]
    async fn hard_delete_preserves_blob_shared_by_checksum_duplicate() {
        let (manager, metadata, _index, blob, _dir) = harness().await;
        let group_id = Uuid::new_v4();
        let v1 = version(group_id, 1, false, "shared-sum");
        let v2 = version(group_id, 2, true, "shared-sum");
        metadata.create_version(v1.clone()).await.unwrap();
        metadata.create_version(v2.clone()).await.unwrap();
        blob.put("documents", &raw_key("shared-sum"), b"bytes".to_vec(), "application/octet-stream")
            .await
            .unwrap();

        manager.delete_version(group_id, v2.id, true).await.unwrap();
        assert!(blob.get("documents", &raw_key("shared-sum")).await.is_ok());
    }
}
