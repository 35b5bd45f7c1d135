//! Index Store Adapter (C3). This store evaluates the `CompoundQuery`
//! structure directly in Rust (cosine similarity plus a BM25-style
//! term-overlap score) instead of shelling out to a real document store.

pub mod memory;
pub mod query;

pub use memory::InMemoryIndexStore;
pub use query::{CompoundQuery, IndexHit, MustClause, ShouldClause};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kb_core::Chunk;
use kb_error::{ErrorCode, KbError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("malformed query: {0}")]
    BadQuery(String),
}

impl From<IndexError> for KbError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable(msg) => KbError::new(ErrorCode::Unavailable, msg),
            IndexError::BadQuery(msg) => KbError::new(ErrorCode::InvalidRequest, msg),
        }
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Idempotent on `chunk_id`: indexing the same chunk twice overwrites
    /// rather than duplicates.
    async fn bulk_index(&self, chunks: Vec<Chunk>, updated_at: DateTime<Utc>) -> Result<(), IndexError>;

    async fn delete_by_version(&self, version_id: Uuid) -> Result<(), IndexError>;

    async fn query(&self, query: CompoundQuery) -> Result<Vec<IndexHit>, IndexError>;

    /// Count of chunks currently indexed for a version; used by the
    /// pipeline's Embed-stage resume logic to detect partially-written
    /// batches (spec §8 scenario 6).
    async fn chunk_ids_for_version(&self, version_id: Uuid) -> Result<Vec<String>, IndexError>;

    /// Full chunk rows (including vectors) currently indexed for a version,
    /// ordered by page number then local index. Used to clone an existing
    /// version's chunks under a new `version_id` when Admit short-circuits
    /// on a checksum match, so the embedding client does not need to be
    /// called again.
    async fn chunks_for_version(&self, version_id: Uuid) -> Result<Vec<Chunk>, IndexError>;

    /// Every distinct `version_id` with at least one indexed chunk;
    /// `kb-cli cleanup-orphans` diffs this against `MetadataStore`'s
    /// version rows to find the invariant-violation candidates spec §7
    /// describes ("log, emit to the cleanup CLI's candidate set, do not
    /// auto-delete").
    async fn indexed_version_ids(&self) -> Result<Vec<Uuid>, IndexError>;
}
