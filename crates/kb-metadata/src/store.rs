use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kb_core::{
    AuditEntry, DocumentGroup, DocumentVersion, Organization, Page, Role, Task, TaskKind,
    TaskState, ToolToken, User, VersionStatus,
};
use kb_error::KbError;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub org_id: Option<Uuid>,
    pub status: Option<VersionStatus>,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub state: Option<TaskState>,
}

/// Every query the core needs, named exactly as spec §4.2 lists them:
/// list versions by group, find active task for version, list pages for
/// version, permission lookup helpers (`get_user`/`get_organization`).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_organization(&self, org: Organization) -> Result<(), KbError>;
    async fn get_organization(&self, id: Uuid) -> Result<Organization, KbError>;

    async fn create_user(&self, user: User) -> Result<(), KbError>;
    async fn get_user(&self, id: Uuid) -> Result<User, KbError>;
    async fn get_user_by_username(&self, username: &str) -> Result<User, KbError>;
    async fn update_user(&self, user: User) -> Result<(), KbError>;

    async fn list_roles(&self) -> Result<Vec<Role>, KbError>;

    async fn create_group(&self, group: DocumentGroup) -> Result<(), KbError>;
    async fn get_group(&self, id: Uuid) -> Result<DocumentGroup, KbError>;
    async fn find_group_by_filename_and_owner(
        &self,
        filename: &str,
        owner_id: Option<Uuid>,
    ) -> Result<Option<DocumentGroup>, KbError>;

    async fn create_version(&self, version: DocumentVersion) -> Result<(), KbError>;
    async fn get_version(&self, id: Uuid) -> Result<DocumentVersion, KbError>;
    /// Whole-row replace; the in-memory implementation serializes this
    /// per version id by taking the table's write lock, matching spec
    /// §4.2's "single-row updates to a version's status+progress are
    /// serialized per version id".
    async fn update_version(&self, version: DocumentVersion) -> Result<(), KbError>;
    async fn list_versions_by_group(&self, group_id: Uuid) -> Result<Vec<DocumentVersion>, KbError>;
    async fn find_completed_version_by_checksum(
        &self,
        checksum: &str,
        owner_id: Option<Uuid>,
    ) -> Result<Option<DocumentVersion>, KbError>;
    /// Multi-row mutation: sets `version_id.is_latest = true` and clears
    /// it on every other version of the same group, atomically.
    async fn promote_latest(&self, group_id: Uuid, version_id: Uuid) -> Result<(), KbError>;
    async fn list_documents(
        &self,
        filter: DocumentFilter,
    ) -> Result<(Vec<DocumentVersion>, u64), KbError>;
    async fn delete_version_row(&self, id: Uuid) -> Result<(), KbError>;

    async fn put_page(&self, page: Page) -> Result<(), KbError>;
    async fn list_pages(&self, version_id: Uuid) -> Result<Vec<Page>, KbError>;
    async fn get_page(&self, version_id: Uuid, page_number: u32) -> Result<Page, KbError>;
    async fn delete_pages_for_version(&self, version_id: Uuid) -> Result<(), KbError>;

    async fn create_task(&self, task: Task) -> Result<(), KbError>;
    async fn get_task(&self, id: Uuid) -> Result<Task, KbError>;
    async fn update_task(&self, task: Task) -> Result<(), KbError>;
    async fn active_task_for_version(&self, version_id: Uuid) -> Result<Option<Task>, KbError>;
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, KbError>;
    /// Conditional claim: atomically transitions one `queued` task (of
    /// the given kinds) to `running` with a fresh lease, or returns
    /// `None` if nothing is claimable.
    async fn claim_next_task(
        &self,
        kinds: &[TaskKind],
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, KbError>;
    /// Returns every task whose lease has expired back to `queued` with
    /// an incremented `attempt_count`, returning the ids touched.
    async fn sweep_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, KbError>;
    async fn child_tasks(&self, parent_task_id: Uuid) -> Result<Vec<Task>, KbError>;

    async fn create_tool_token(&self, token: ToolToken) -> Result<(), KbError>;
    async fn get_tool_token(&self, id: Uuid) -> Result<ToolToken, KbError>;
    async fn find_tool_token_by_secret_hash(
        &self,
        secret_hash: &str,
    ) -> Result<Option<ToolToken>, KbError>;
    async fn update_tool_token(&self, token: ToolToken) -> Result<(), KbError>;
    async fn list_tool_tokens_by_owner(&self, owner_id: Uuid) -> Result<Vec<ToolToken>, KbError>;

    /// Monotonic per-user version bumped on role change or token
    /// revocation; tool-token verification re-checks it (SPEC_FULL
    /// §4.12 supplement).
    async fn bump_user_authz_version(&self, user_id: Uuid) -> Result<u64, KbError>;
    async fn get_user_authz_version(&self, user_id: Uuid) -> Result<u64, KbError>;

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), KbError>;
    async fn list_audit_for_target(&self, target: &str) -> Result<Vec<AuditEntry>, KbError>;
}
