use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kb_core::{
    AuditEntry, DocumentGroup, DocumentVersion, Organization, Page, Role, RoleCode, Task,
    TaskKind, TaskState, ToolToken, User, VersionStatus,
};
use kb_error::KbError;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::store::{DocumentFilter, MetadataStore, TaskFilter};

/// In-memory reference implementation. Each table sits behind its own
/// `RwLock`; a write lock on a table serializes every mutation to that
/// table, which trivially satisfies "single-row updates serialized per
/// id" and "multi-row mutations atomic" since both hold the same lock
/// for their whole critical section.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    organizations: RwLock<HashMap<Uuid, Organization>>,
    users: RwLock<HashMap<Uuid, User>>,
    roles: RwLock<Vec<Role>>,
    groups: RwLock<HashMap<Uuid, DocumentGroup>>,
    versions: RwLock<HashMap<Uuid, DocumentVersion>>,
    pages: RwLock<HashMap<(Uuid, u32), Page>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    tool_tokens: RwLock<HashMap<Uuid, ToolToken>>,
    authz_versions: RwLock<HashMap<Uuid, u64>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        InMemoryMetadataStore::default()
    }

    /// Seeds the closed core role set (`admin`, `editor`, `viewer`).
    pub async fn with_default_roles() -> Self {
        let store = Self::new();
        {
            let mut roles = store.roles.write().await;
            roles.push(Role {
                code: RoleCode::admin(),
                name: "Administrator".to_string(),
                system_flag: true,
            });
            roles.push(Role {
                code: RoleCode::editor(),
                name: "Editor".to_string(),
                system_flag: true,
            });
            roles.push(Role {
                code: RoleCode::viewer(),
                name: "Viewer".to_string(),
                system_flag: true,
            });
        }
        store
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_organization(&self, org: Organization) -> Result<(), KbError> {
        self.organizations.write().await.insert(org.id, org);
        Ok(())
    }

    async fn get_organization(&self, id: Uuid) -> Result<Organization, KbError> {
        self.organizations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("organization not found").with_context("org_id", id.to_string()))
    }

    async fn create_user(&self, user: User) -> Result<(), KbError> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<User, KbError> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("user not found").with_context("user_id", id.to_string()))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<User, KbError> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned()
            .ok_or_else(|| KbError::not_found("user not found").with_context("username", username))
    }

    async fn update_user(&self, user: User) -> Result<(), KbError> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, KbError> {
        Ok(self.roles.read().await.clone())
    }

    async fn create_group(&self, group: DocumentGroup) -> Result<(), KbError> {
        self.groups.write().await.insert(group.group_id, group);
        Ok(())
    }

    async fn get_group(&self, id: Uuid) -> Result<DocumentGroup, KbError> {
        self.groups
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("document group not found").with_context("group_id", id.to_string()))
    }

    async fn find_group_by_filename_and_owner(
        &self,
        filename: &str,
        owner_id: Option<Uuid>,
    ) -> Result<Option<DocumentGroup>, KbError> {
        Ok(self
            .groups
            .read()
            .await
            .values()
            .find(|g| g.canonical_filename == filename && g.owner_id == owner_id)
            .cloned())
    }

    async fn create_version(&self, version: DocumentVersion) -> Result<(), KbError> {
        self.versions.write().await.insert(version.id, version);
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<DocumentVersion, KbError> {
        self.versions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("document version not found").with_context("version_id", id.to_string()))
    }

    async fn update_version(&self, version: DocumentVersion) -> Result<(), KbError> {
        let mut table = self.versions.write().await;
        if !table.contains_key(&version.id) {
            return Err(KbError::not_found("document version not found")
                .with_context("version_id", version.id.to_string()));
        }
        table.insert(version.id, version);
        Ok(())
    }

    async fn list_versions_by_group(&self, group_id: Uuid) -> Result<Vec<DocumentVersion>, KbError> {
        let mut versions: Vec<DocumentVersion> = self
            .versions
            .read()
            .await
            .values()
            .filter(|v| v.group_id == group_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn find_completed_version_by_checksum(
        &self,
        checksum: &str,
        owner_id: Option<Uuid>,
    ) -> Result<Option<DocumentVersion>, KbError> {
        Ok(self
            .versions
            .read()
            .await
            .values()
            .find(|v| {
                v.checksum == checksum
                    && v.uploaded_by == owner_id
                    && v.status == VersionStatus::Completed
            })
            .cloned())
    }

    async fn promote_latest(&self, group_id: Uuid, version_id: Uuid) -> Result<(), KbError> {
        let mut table = self.versions.write().await;
        if !table.contains_key(&version_id) {
            return Err(KbError::not_found("document version not found")
                .with_context("version_id", version_id.to_string()));
        }
        for v in table.values_mut() {
            if v.group_id == group_id {
                v.is_latest = v.id == version_id;
            }
        }
        debug!(%group_id, %version_id, "promoted latest version");
        Ok(())
    }

    async fn list_documents(
        &self,
        filter: DocumentFilter,
    ) -> Result<(Vec<DocumentVersion>, u64), KbError> {
        let mut matched: Vec<DocumentVersion> = self
            .versions
            .read()
            .await
            .values()
            .filter(|v| filter.org_id.map(|o| v.org_id == Some(o)).unwrap_or(true))
            .filter(|v| filter.status.map(|s| v.status == s).unwrap_or(true))
            .filter(|v| !v.superseded)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = matched.len() as u64;
        let page_size = filter.page_size.max(1) as usize;
        let start = (filter.page as usize).saturating_mul(page_size);
        let page = matched.into_iter().skip(start).take(page_size).collect();
        Ok((page, total))
    }

    async fn delete_version_row(&self, id: Uuid) -> Result<(), KbError> {
        self.versions.write().await.remove(&id);
        Ok(())
    }

    async fn put_page(&self, page: Page) -> Result<(), KbError> {
        self.pages
            .write()
            .await
            .insert((page.document_version_id, page.page_number), page);
        Ok(())
    }

    async fn list_pages(&self, version_id: Uuid) -> Result<Vec<Page>, KbError> {
        let mut pages: Vec<Page> = self
            .pages
            .read()
            .await
            .values()
            .filter(|p| p.document_version_id == version_id)
            .cloned()
            .collect();
        pages.sort_by_key(|p| p.page_number);
        Ok(pages)
    }

    async fn get_page(&self, version_id: Uuid, page_number: u32) -> Result<Page, KbError> {
        self.pages
            .read()
            .await
            .get(&(version_id, page_number))
            .cloned()
            .ok_or_else(|| {
                KbError::not_found("page not found")
                    .with_context("version_id", version_id.to_string())
                    .with_context("page_number", page_number)
            })
    }

    async fn delete_pages_for_version(&self, version_id: Uuid) -> Result<(), KbError> {
        self.pages.write().await.retain(|(v, _), _| *v != version_id);
        Ok(())
    }

    async fn create_task(&self, task: Task) -> Result<(), KbError> {
        self.tasks.write().await.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Task, KbError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("task not found").with_context("task_id", id.to_string()))
    }

    async fn update_task(&self, task: Task) -> Result<(), KbError> {
        let mut table = self.tasks.write().await;
        if !table.contains_key(&task.id) {
            return Err(KbError::not_found("task not found").with_context("task_id", task.id.to_string()));
        }
        table.insert(task.id, task);
        Ok(())
    }

    async fn active_task_for_version(&self, version_id: Uuid) -> Result<Option<Task>, KbError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .find(|t| t.target_version_id == version_id && !t.state.is_terminal())
            .cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, KbError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.kind.map(|k| t.kind == k).unwrap_or(true))
            .filter(|t| filter.state.map(|s| t.state == s).unwrap_or(true))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn claim_next_task(
        &self,
        kinds: &[TaskKind],
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, KbError> {
        let mut table = self.tasks.write().await;
        let mut candidates: Vec<&mut Task> = table
            .values_mut()
            .filter(|t| t.state == TaskState::Queued && kinds.contains(&t.kind))
            .collect();
        candidates.sort_by_key(|t| t.created_at);
        let claimed = candidates.into_iter().next();
        match claimed {
            Some(task) => {
                task.state = TaskState::Running;
                task.lease_expires_at = Some(now + lease_ttl);
                task.updated_at = now;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, KbError> {
        let mut table = self.tasks.write().await;
        let mut swept = Vec::new();
        for task in table.values_mut() {
            if task.state == TaskState::Running {
                if let Some(lease) = task.lease_expires_at {
                    if lease <= now {
                        task.state = TaskState::Queued;
                        task.attempt_count += 1;
                        task.lease_expires_at = None;
                        task.updated_at = now;
                        swept.push(task.id);
                    }
                }
            }
        }
        Ok(swept)
    }

    async fn child_tasks(&self, parent_task_id: Uuid) -> Result<Vec<Task>, KbError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.parent_task_id == Some(parent_task_id))
            .cloned()
            .collect())
    }

    async fn create_tool_token(&self, token: ToolToken) -> Result<(), KbError> {
        self.tool_tokens.write().await.insert(token.id, token);
        Ok(())
    }

    async fn get_tool_token(&self, id: Uuid) -> Result<ToolToken, KbError> {
        self.tool_tokens
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::not_found("tool token not found").with_context("token_id", id.to_string()))
    }

    async fn find_tool_token_by_secret_hash(
        &self,
        secret_hash: &str,
    ) -> Result<Option<ToolToken>, KbError> {
        Ok(self
            .tool_tokens
            .read()
            .await
            .values()
            .find(|t| t.secret_hash == secret_hash)
            .cloned())
    }

    async fn update_tool_token(&self, token: ToolToken) -> Result<(), KbError> {
        self.tool_tokens.write().await.insert(token.id, token);
        Ok(())
    }

    async fn list_tool_tokens_by_owner(&self, owner_id: Uuid) -> Result<Vec<ToolToken>, KbError> {
        Ok(self
            .tool_tokens
            .read()
            .await
            .values()
            .filter(|t| t.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn bump_user_authz_version(&self, user_id: Uuid) -> Result<u64, KbError> {
        let mut table = self.authz_versions.write().await;
        let entry = table.entry(user_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn get_user_authz_version(&self, user_id: Uuid) -> Result<u64, KbError> {
        Ok(*self.authz_versions.read().await.get(&user_id).unwrap_or(&0))
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), KbError> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn list_audit_for_target(&self, target: &str) -> Result<Vec<AuditEntry>, KbError> {
        Ok(self
            .audit
            .read()
            .await
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kb_core::{StageCursor, StageName};

    fn sample_task(version_id: Uuid) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            kind: TaskKind::IngestDocument,
            target_version_id: version_id,
            parent_task_id: None,
            state: TaskState::Queued,
            stage_cursor: Some(StageCursor {
                version_id,
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

    #[tokio::test]
    async fn claim_next_task_is_fifo_and_sets_lease() {
        let store = InMemoryMetadataStore::new();
        let v = Uuid::new_v4();
        let t1 = sample_task(v);
        let t2 = sample_task(v);
        store.create_task(t1.clone()).await.unwrap();
        store.create_task(t2.clone()).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim_next_task(&[TaskKind::IngestDocument], Duration::seconds(30), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, t1.id);
        assert_eq!(claimed.state, TaskState::Running);
        assert!(claimed.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn sweep_returns_expired_leases_to_queued_with_incremented_attempts() {
        let store = InMemoryMetadataStore::new();
        let v = Uuid::new_v4();
        let mut task = sample_task(v);
        task.state = TaskState::Running;
        task.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        store.create_task(task.clone()).await.unwrap();

        let swept = store.sweep_expired_leases(Utc::now()).await.unwrap();
        assert_eq!(swept, vec![task.id]);
        let reloaded = store.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.state, TaskState::Queued);
        assert_eq!(reloaded.attempt_count, 1);
    }

    #[tokio::test]
    async fn promote_latest_clears_other_versions_in_group() {
        use kb_core::{DocumentVersion, Visibility};
        let store = InMemoryMetadataStore::new();
        let group_id = Uuid::new_v4();
        let mk = |n: u32, latest: bool| DocumentVersion {
            id: Uuid::new_v4(),
            group_id,
            version_number: n,
            is_latest: latest,
            checksum: format!("sum{n}"),
            file_type: "pdf".to_string(),
            file_size: 10,
            storage_key: "k".to_string(),
            status: VersionStatus::Completed,
            total_pages: 1,
            processed_pages: 1,
            progress_percent: 100.0,
            progress_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            uploaded_by: None,
            visibility: Visibility::Private,
            shared_user_ids: Default::default(),
            shared_role_codes: Default::default(),
            error_message: None,
            owner_id: None,
            org_id: None,
            processing_mode: kb_core::ProcessingMode::Fast,
            ocr_engine: "mock-ocr".to_string(),
            superseded: false,
        };
        let v1 = mk(1, true);
        let v2 = mk(2, false);
        store.create_version(v1.clone()).await.unwrap();
        store.create_version(v2.clone()).await.unwrap();

        store.promote_latest(group_id, v2.id).await.unwrap();
        let versions = store.list_versions_by_group(group_id).await.unwrap();
        let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).map(|v| v.id).collect();
        assert_eq!(latest, vec![v2.id]);
    }
}
