//! Operational command bodies (spec §6): kept free of `clap` so they can be
//! unit-tested directly, the same separation the reference CLI draws
//! between `main.rs`'s argument parsing and `commands::*`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use kb_auth::TokenService;
use kb_config::KbConfig;
use kb_core::TaskKind;
use kb_index::IndexStore;
use kb_metadata::{DocumentFilter, MetadataStore};
use kb_pipeline::PipelineOrchestrator;
use kb_tasks::{QueuePriority, TaskManager, WorkerPool, WorkerPoolConfig};
use uuid::Uuid;

/// `kb init-index`: validates the config and confirms the index backend
/// is reachable by issuing an empty bulk-index call. Real-world wiring
/// against a remote index talks to `index_hosts`; the in-process
/// reference store always succeeds, which is enough to catch a
/// misconfigured connection before a real ingest run hits it.
pub async fn init_index(config: &KbConfig, index: &dyn IndexStore) -> Result<()> {
    if config.index_hosts.is_empty() {
        tracing::warn!("no index_hosts configured; using the in-process reference index store");
    }
    index
        .bulk_index(Vec::new(), chrono::Utc::now())
        .await
        .context("index backend did not accept an empty bulk-index call")?;
    println!("index initialized");
    Ok(())
}

/// `kb migrate`: applies the storage-layout side effects config load alone
/// does not (currently just ensuring the blob root exists); a real
/// deployment would also run `MetadataStore` schema migrations here.
pub async fn migrate(config: &KbConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.blob_root)
        .await
        .with_context(|| format!("create blob root {}", config.blob_root.display()))?;
    println!("migrated: blob root ready at {}", config.blob_root.display());
    Ok(())
}

/// `kb cleanup-orphans`: diffs indexed `version_id`s against metadata's
/// version rows. Per spec §7's invariant-violation policy this only
/// reports candidates, it never deletes anything itself.
pub async fn cleanup_orphans(
    metadata: &dyn MetadataStore,
    index: &dyn IndexStore,
) -> Result<Vec<Uuid>> {
    let indexed = index
        .indexed_version_ids()
        .await
        .context("list indexed version ids")?;
    let (versions, _total) = metadata
        .list_documents(DocumentFilter {
            page_size: 100_000,
            ..DocumentFilter::default()
        })
        .await
        .context("list document versions")?;
    let known: std::collections::BTreeSet<Uuid> = versions.iter().map(|v| v.id).collect();

    let orphans: Vec<Uuid> = indexed.into_iter().filter(|id| !known.contains(id)).collect();
    if orphans.is_empty() {
        println!("no orphaned chunks found");
    } else {
        for id in &orphans {
            println!("orphan candidate: version_id={id} (indexed but no metadata row)");
        }
    }
    Ok(orphans)
}

/// `kb reindex-version <id>`: enqueues a `ReEmbed` task and drains it to a
/// terminal state synchronously, so the command blocks until the version
/// is actually reindexed rather than returning as soon as it is queued.
pub async fn reindex_version(
    tasks: Arc<TaskManager>,
    metadata: Arc<dyn MetadataStore>,
    orchestrator: Arc<PipelineOrchestrator>,
    version_id: Uuid,
) -> Result<()> {
    metadata
        .get_version(version_id)
        .await
        .with_context(|| format!("version {version_id} does not exist"))?;

    let task = tasks
        .enqueue(TaskKind::ReEmbed, version_id, None, QueuePriority::High)
        .await
        .context("enqueue re-embed task")?;

    let pool = WorkerPool::new(
        "cli_reindex",
        WorkerPoolConfig::default(),
        vec![TaskKind::ReEmbed],
        metadata,
    );

    let mut guard = 0;
    loop {
        guard += 1;
        if guard > 10_000 {
            bail!("task {} did not reach a terminal state", task.id);
        }
        let progressed = pool
            .run_once(orchestrator.as_ref())
            .await
            .context("run reindex step")?;
        let current = tasks.progress(task.id).await.context("read task progress")?;
        if current.state.is_terminal() {
            if current.state == kb_core::TaskState::Failed {
                bail!(
                    "reindex of version {version_id} failed: {:?}",
                    current.last_error
                );
            }
            println!("reindex of version {version_id} finished as {:?}", current.state);
            return Ok(());
        }
        if !progressed {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }
}

/// `kb rotate-tokens --user <username>`: revokes every tool token owned by
/// the user (by bumping their `authz_version`, per spec §4.12 supplement)
/// and mints a replacement, printing the one-time cleartext secret.
pub async fn rotate_tokens(
    metadata: Arc<dyn MetadataStore>,
    tokens: &TokenService,
    username: &str,
) -> Result<String> {
    let user = metadata
        .get_user_by_username(username)
        .await
        .with_context(|| format!("no user named {username}"))?;

    tokens
        .bump_authz_version(user.id)
        .await
        .context("bump authz version")?;

    let (_token, secret) = tokens
        .issue_tool_token(&user, format!("{username}-rotated"), None)
        .await
        .context("issue replacement tool token")?;

    println!("tokens rotated for {username}");
    println!("new tool token secret (shown once): {secret}");
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kb_core::{Chunk, ChunkMetadata, DocumentGroup, DocumentVersion, ProcessingMode, Visibility};
    use kb_index::InMemoryIndexStore;
    use kb_metadata::InMemoryMetadataStore;
    use std::collections::BTreeSet;

    fn sample_chunk(version_id: Uuid) -> Chunk {
        Chunk {
            chunk_id: format!("chunk-{version_id}-0"),
            version_id,
            page_number: 1,
            local_index: 0,
            text: "hello".to_string(),
            vector: Some(vec![1.0, 0.0]),
            metadata: ChunkMetadata {
                document_id: Uuid::new_v4(),
                owner_id: None,
                org_id: None,
                visibility: Visibility::Organization,
                shared_with_users: BTreeSet::new(),
                shared_with_roles: BTreeSet::new(),
                filename: "doc.pdf".to_string(),
                filepath: None,
                checksum: "abc".to_string(),
                file_type: "pdf".to_string(),
                original_file_url: None,
                page_image_url: None,
            },
        }
    }

    #[tokio::test]
    async fn cleanup_orphans_reports_chunks_with_no_metadata_row() {
        let metadata = InMemoryMetadataStore::new();
        let index = InMemoryIndexStore::new();

        let orphan_version = Uuid::new_v4();
        index
            .bulk_index(vec![sample_chunk(orphan_version)], Utc::now())
            .await
            .unwrap();

        let orphans = cleanup_orphans(&metadata, &index).await.unwrap();
        assert_eq!(orphans, vec![orphan_version]);
    }

    #[tokio::test]
    async fn cleanup_orphans_is_empty_when_every_indexed_version_has_a_row() {
        let metadata = InMemoryMetadataStore::new();
        let index = InMemoryIndexStore::new();

        let org_id = Uuid::new_v4();
        let group = DocumentGroup {
            group_id: Uuid::new_v4(),
            canonical_filename: "doc.pdf".to_string(),
            owner_id: None,
            org_id: Some(org_id),
        };
        metadata.create_group(group.clone()).await.unwrap();

        let version = DocumentVersion {
            id: Uuid::new_v4(),
            group_id: group.group_id,
            version_number: 1,
            is_latest: true,
            checksum: "abc".to_string(),
            file_type: "pdf".to_string(),
            file_size: 10,
            storage_key: "blobs/abc".to_string(),
            status: kb_core::VersionStatus::Completed,
            total_pages: 1,
            processed_pages: 1,
            progress_percent: 100.0,
            progress_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            uploaded_by: None,
            visibility: Visibility::Organization,
            shared_user_ids: BTreeSet::new(),
            shared_role_codes: BTreeSet::new(),
            error_message: None,
            owner_id: None,
            org_id: Some(org_id),
            processing_mode: ProcessingMode::Fast,
            ocr_engine: "tesseract".to_string(),
            superseded: false,
        };
        metadata.create_version(version.clone()).await.unwrap();
        index
            .bulk_index(vec![sample_chunk(version.id)], Utc::now())
            .await
            .unwrap();

        let orphans = cleanup_orphans(&metadata, &index).await.unwrap();
        assert!(orphans.is_empty());
    }

    #[tokio::test]
    async fn rotate_tokens_issues_a_fresh_secret_and_bumps_authz_version() {
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::with_default_roles().await);
        let user = kb_core::User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: kb_auth::hash_password("s3cret!").unwrap(),
            org_id: None,
            is_active: true,
            is_superuser: false,
            role_codes: Default::default(),
            created_at: Utc::now(),
            last_login: None,
        };
        metadata.create_user(user.clone()).await.unwrap();

        let token_service = TokenService::new(b"test-secret", metadata.clone());
        let before = metadata.get_user_authz_version(user.id).await.unwrap();
        let secret = rotate_tokens(metadata.clone(), &token_service, "alice").await.unwrap();
        assert!(!secret.is_empty());
        let after = metadata.get_user_authz_version(user.id).await.unwrap();
        assert!(after > before);
    }
}
