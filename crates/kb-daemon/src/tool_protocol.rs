//! Tool-protocol surface (spec §6): a narrower, stateful-agent-facing API
//! distinct from the HTTP routes in [`crate::api`] — `hybrid_search` wraps
//! [`kb_search::SearchOrchestrator`] directly, and `execute_raw_query`
//! passes a caller-built query straight through to [`kb_index::IndexStore`]
//! for superusers only.

use std::sync::Arc;

use kb_core::user::AuthContext;
use kb_error::KbError;
use kb_index::{CompoundQuery, IndexHit, IndexStore};
use kb_search::{SearchFilters, SearchHit, SearchOrchestrator, SearchRequest};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct HybridSearchParams {
    pub query: String,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default = "default_size")]
    pub size: usize,
    pub min_score: Option<f32>,
}

fn default_size() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct HybridSearchResult {
    pub hits: Vec<SearchHit>,
}

/// The `hybrid_search` tool call. `params.index` is accepted for parity
/// with the wire shape but unused: this workspace has exactly one chunk
/// index, so there is nothing to select between.
#[instrument(level = "info", skip(search, ctx))]
pub async fn hybrid_search(
    search: &SearchOrchestrator,
    ctx: &AuthContext,
    params: HybridSearchParams,
) -> Result<HybridSearchResult, KbError> {
    let hits = search
        .search(
            ctx,
            SearchRequest {
                query_text: params.query,
                k: params.size,
                filters: SearchFilters::default(),
                min_score: params.min_score,
                use_hybrid: true,
            },
        )
        .await?;
    Ok(HybridSearchResult { hits })
}

#[derive(Debug, Deserialize)]
pub struct RawQueryParams {
    pub query: CompoundQuery,
}

/// The `execute_raw_query` tool call: a passthrough to the index, gated
/// on the caller being a superuser since a raw [`CompoundQuery`] bypasses
/// the permission-fragment composition [`kb_search::SearchOrchestrator`]
/// otherwise always injects.
#[instrument(level = "info", skip(index, ctx, params))]
pub async fn execute_raw_query(
    index: &Arc<dyn IndexStore>,
    ctx: &AuthContext,
    params: RawQueryParams,
) -> Result<Vec<IndexHit>, KbError> {
    if !ctx.is_superuser {
        return Err(KbError::forbidden("execute_raw_query requires a superuser caller"));
    }
    index.query(params.query).await.map_err(KbError::from)
}
