use chrono::{DateTime, Utc};
use kb_core::chunk::ChunkMetadata;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MustClause {
    Term { field: String, value: String },
    Terms { field: String, values: Vec<String> },
    Wildcard { field: String, pattern: String },
    /// A disjunction of must-satisfy-one-of clauses, used to express the
    /// permission predicate's own internal `should`/`minimum_should_match:
    /// 1` fragment inside the outer query's `must` clause.
    AnyOf(Vec<MustClause>),
    /// A conjunction, the dual of [`MustClause::AnyOf`], needed to nest
    /// "visibility = organization AND org_id = X" inside a surrounding
    /// disjunction.
    AllOf(Vec<MustClause>),
    /// `field` is a multi-valued (comma-joined) property and contains
    /// `value` as one of its members — e.g. `U.id ∈ R.shared_with_users`.
    Contains { field: String, value: String },
    /// `field` is multi-valued and contains at least one of `values` —
    /// e.g. `R.shared_with_roles ∩ U.role_codes ≠ ∅`.
    ContainsAny { field: String, values: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShouldClause {
    ScriptScoreVector { vector: Vec<f32>, weight: f32 },
    MultiMatch {
        query_text: String,
        fields: Vec<(String, f32)>,
        weight: f32,
    },
}

/// Structured query accepted by [`crate::IndexStore::query`], built by
/// `kb-search` from the algorithm in spec §4.10.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompoundQuery {
    pub must: Vec<MustClause>,
    pub should: Vec<ShouldClause>,
    pub minimum_should_match: u32,
    pub highlight_fields: Vec<String>,
    pub min_score: Option<f32>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub chunk_id: String,
    pub version_id: Uuid,
    pub page_number: u32,
    pub score: f32,
    pub text: String,
    pub highlighted: Option<String>,
    pub metadata: ChunkMetadata,
    pub updated_at: DateTime<Utc>,
}
