//! Domain entities shared by every crate in the workspace. Nothing here
//! performs I/O; storage adapters (`kb-metadata`, `kb-blob`, `kb-index`)
//! own persistence, this crate only owns shape and the invariants that
//! are cheap to check locally (e.g. bbox ordering, chunk id derivation).

pub mod audit;
pub mod chunk;
pub mod document;
pub mod organization;
pub mod page;
pub mod role;
pub mod session_token;
pub mod task;
pub mod tool_token;
pub mod user;

pub use audit::AuditEntry;
pub use chunk::Chunk;
pub use document::{DocumentGroup, DocumentVersion, ProcessingMode, Visibility, VersionStatus};
pub use organization::Organization;
pub use page::{BBox, Page};
pub use role::RoleCode;
pub use session_token::{SessionToken, SessionTokenKind};
pub use task::{StageCursor, StageName, Task, TaskKind, TaskState};
pub use tool_token::ToolToken;
pub use user::User;
