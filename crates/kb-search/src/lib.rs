//! Search Orchestrator (C10): the seven-step hybrid algorithm from
//! `spec.md` §4.10, grounded on `kb-index`'s `CompoundQuery` AST and
//! `kb-permissions`'s single predicate. Builds the query, runs it, and
//! enriches each hit with bbox matches looked up from `kb-metadata`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kb_config::HybridSearchConfig;
use kb_core::chunk::ChunkMetadata;
use kb_core::page::BBoxSpan;
use kb_core::user::AuthContext;
use kb_error::{ErrorCode, KbError};
use kb_index::{CompoundQuery, IndexHit, IndexStore, MustClause, ShouldClause};
use kb_metadata::MetadataStore;
use kb_models::EmbeddingClient;
use kb_permissions::permission_query_fragment;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

/// Field weights for the lexical `multi_match` half of the query, scoped
/// to the fields `spec.md` §3's data model actually carries on a Chunk
/// record. The original field-weight list in `spec.md` §4.10 additionally
/// names `metadata.description`, `document_name`, `drawing_number`,
/// `project_name`, `equipment_tags`, and `component_details` — fields
/// from a richer domain-specific schema that `kb-core::ChunkMetadata`
/// does not carry (recorded in `DESIGN.md`), so this list is the subset
/// that resolves against real chunk fields.
pub const LEXICAL_FIELDS: &[(&str, f32)] = &[
    ("text", 3.0),
    ("metadata.filename", 2.5),
    ("metadata.filepath", 1.5),
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    pub file_type: Option<String>,
    pub filename_wildcard: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: String,
    pub k: usize,
    pub filters: SearchFilters,
    pub min_score: Option<f32>,
    pub use_hybrid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BBoxMatch {
    pub text: String,
    pub confidence: f32,
    pub bbox: kb_core::page::BBox,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub version_id: Uuid,
    pub page_number: u32,
    pub score: f32,
    pub text: String,
    pub highlighted: Option<String>,
    pub metadata: ChunkMetadata,
    pub updated_at: DateTime<Utc>,
    pub bbox_matches: Vec<BBoxMatch>,
}

pub struct SearchOrchestrator {
    index: Arc<dyn IndexStore>,
    metadata: Arc<dyn MetadataStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: HybridSearchConfig,
}

impl SearchOrchestrator {
    pub fn new(
        index: Arc<dyn IndexStore>,
        metadata: Arc<dyn MetadataStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        config: HybridSearchConfig,
    ) -> Self {
        SearchOrchestrator { index, metadata, embeddings, config }
    }

    /// Steps 1-7 of spec §4.10. `k = 0` returns an empty result without
    /// touching the index (an explicit "no results wanted" request, not
    /// an error).
    #[instrument(level = "info", skip(self, ctx), fields(query_len = request.query_text.len()))]
    pub async fn search(&self, ctx: &AuthContext, request: SearchRequest) -> Result<Vec<SearchHit>, KbError> {
        if request.k == 0 {
            return Ok(Vec::new());
        }

        let mut must = Vec::new();
        if let Some(fragment) = permission_query_fragment(ctx) {
            must.push(fragment);
        }
        if let Some(file_type) = &request.filters.file_type {
            must.push(MustClause::Term { field: "metadata.file_type".to_string(), value: file_type.clone() });
        }
        if let Some(pattern) = &request.filters.filename_wildcard {
            must.push(MustClause::Wildcard { field: "metadata.filename".to_string(), pattern: pattern.clone() });
        }

        let query_text = request.query_text.trim();
        let mut should = Vec::new();
        let mut minimum_should_match = 0;

        if request.use_hybrid && !query_text.is_empty() {
            let vector = self.embeddings.embed(query_text).await.map_err(KbError::from)?;
            should.push(ShouldClause::ScriptScoreVector { vector, weight: self.config.vector_weight });
            should.push(ShouldClause::MultiMatch {
                query_text: query_text.to_string(),
                fields: LEXICAL_FIELDS.iter().map(|(f, w)| (f.to_string(), *w)).collect(),
                weight: self.config.bm25_weight,
            });
            minimum_should_match = 1;
        }

        let compound = CompoundQuery {
            must,
            should,
            minimum_should_match,
            highlight_fields: LEXICAL_FIELDS.iter().map(|(f, _)| f.to_string()).collect(),
            min_score: request.min_score,
            size: request.k,
        };

        let hits = self.index.query(compound).await.map_err(KbError::from)?;

        // Empty query degrades to filter-only lexical listing, ordered
        // newest-first rather than by (zero) score, per spec §4.10.
        let mut hits = hits;
        if query_text.is_empty() || !request.use_hybrid {
            hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.page_number.cmp(&b.page_number)));
        }

        let tokens = tokenize(query_text);
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let bbox_matches = self.bbox_matches(&hit, &tokens).await?;
            out.push(SearchHit {
                chunk_id: hit.chunk_id,
                version_id: hit.version_id,
                page_number: hit.page_number,
                score: hit.score,
                text: hit.text,
                highlighted: hit.highlighted,
                metadata: hit.metadata,
                updated_at: hit.updated_at,
                bbox_matches,
            });
        }
        Ok(out)
    }

    /// Step 6: intersect query tokens against the hit's page's OCR
    /// bboxes, keeping only spans that share ≥ 1 token, sorted by
    /// confidence desc. A page lookup failure (e.g. a page row pruned by
    /// a concurrent hard delete) degrades to no bbox matches rather than
    /// failing the whole search.
    async fn bbox_matches(&self, hit: &IndexHit, query_tokens: &[String]) -> Result<Vec<BBoxMatch>, KbError> {
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let page = match self.metadata.get_page(hit.version_id, hit.page_number).await {
            Ok(page) => page,
            Err(err) if err.code == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut matches: Vec<BBoxMatch> = page
            .bboxes
            .into_iter()
            .filter(|span| span_shares_token(span, query_tokens))
            .map(|span| BBoxMatch { text: span.text, confidence: span.confidence, bbox: span.bbox })
            .collect();
        matches.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matches)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn span_shares_token(span: &BBoxSpan, query_tokens: &[String]) -> bool {
    let span_tokens = tokenize(&span.text);
    query_tokens.iter().any(|qt| span_tokens.iter().any(|st| st == qt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::chunk::ChunkMetadata;
    use kb_core::document::Visibility;
    use kb_core::page::{BBox, Page};
    use kb_core::Chunk;
    use kb_metadata::InMemoryMetadataStore;
    use kb_models::MockModelGateway;
    use std::collections::BTreeSet;

    fn chunk(version_id: Uuid, page: u32, text: &str, owner: Option<Uuid>, vis: Visibility) -> Chunk {
        Chunk {
            chunk_id: format!("{version_id}-{page}"),
            version_id,
            page_number: page,
            local_index: 0,
            text: text.to_string(),
            vector: Some(vec![1.0, 0.0]),
            metadata: ChunkMetadata {
                document_id: version_id,
                owner_id: owner,
                org_id: None,
                visibility: vis,
                shared_with_users: BTreeSet::new(),
                shared_with_roles: BTreeSet::new(),
                filename: "manual.pdf".to_string(),
                filepath: None,
                checksum: "abc".to_string(),
                file_type: "pdf".to_string(),
                original_file_url: None,
                page_image_url: None,
            },
        }
    }

    async fn orchestrator() -> (SearchOrchestrator, Arc<dyn IndexStore>, Arc<dyn MetadataStore>) {
        let index: Arc<dyn IndexStore> = Arc::new(kb_index::InMemoryIndexStore::new());
        let metadata: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
        let embeddings: Arc<dyn EmbeddingClient> = Arc::new(MockModelGateway);
        let orchestrator = SearchOrchestrator::new(index.clone(), metadata.clone(), embeddings, HybridSearchConfig::default());
        (orchestrator, index, metadata)
    }

    fn request(text: &str, k: usize) -> SearchRequest {
        SearchRequest { query_text: text.to_string(), k, filters: SearchFilters::default(), min_score: None, use_hybrid: true }
    }

    #[tokio::test]
    async fn k_zero_returns_empty_without_querying() {
        let (orchestrator, _index, _metadata) = orchestrator().await;
        let hits = orchestrator.search(&AuthContext::anonymous(), request("reset", 0)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn unauthorized_caller_never_sees_a_private_hit() {
        let (orchestrator, index, _metadata) = orchestrator().await;
        let owner = Uuid::new_v4();
        let c = chunk(Uuid::new_v4(), 1, "reset the device", Some(owner), Visibility::Private);
        index.bulk_index(vec![c], Utc::now()).await.unwrap();

        let hits = orchestrator.search(&AuthContext::anonymous(), request("reset", 10)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn owner_sees_their_own_private_hit() {
        let (orchestrator, index, _metadata) = orchestrator().await;
        let owner = Uuid::new_v4();
        let c = chunk(Uuid::new_v4(), 1, "reset the device", Some(owner), Visibility::Private);
        index.bulk_index(vec![c], Utc::now()).await.unwrap();

        let ctx = AuthContext { user_id: Some(owner), org_id: None, role_codes: BTreeSet::new(), is_superuser: false };
        let hits = orchestrator.search(&ctx, request("reset", 10)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.filename, "manual.pdf");
    }

    #[tokio::test]
    async fn min_score_of_one_excludes_imperfect_matches() {
        let (orchestrator, index, _metadata) = orchestrator().await;
        let c = chunk(Uuid::new_v4(), 1, "reset the device", None, Visibility::Public);
        index.bulk_index(vec![c], Utc::now()).await.unwrap();

        let mut req = request("reset", 10);
        req.min_score = Some(1.0);
        let hits = orchestrator.search(&AuthContext::anonymous(), req).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn single_character_query_still_invokes_embedding() {
        let (orchestrator, index, _metadata) = orchestrator().await;
        let c = chunk(Uuid::new_v4(), 1, "a", None, Visibility::Public);
        index.bulk_index(vec![c], Utc::now()).await.unwrap();

        let hits = orchestrator.search(&AuthContext::anonymous(), request("a", 10)).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn empty_query_degrades_to_lexical_listing_ordered_by_updated_at() {
        let (orchestrator, index, _metadata) = orchestrator().await;
        let older = chunk(Uuid::new_v4(), 1, "alpha", None, Visibility::Public);
        let newer = chunk(Uuid::new_v4(), 1, "beta", None, Visibility::Public);
        index.bulk_index(vec![older.clone()], Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        index.bulk_index(vec![newer.clone()], Utc::now()).await.unwrap();

        let hits = orchestrator.search(&AuthContext::anonymous(), request("", 10)).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, newer.chunk_id);
    }

    #[tokio::test]
    async fn bbox_matches_filter_to_shared_tokens_sorted_by_confidence() {
        let (orchestrator, index, metadata) = orchestrator().await;
        let version_id = Uuid::new_v4();
        let c = chunk(version_id, 1, "reset the device", None, Visibility::Public);
        index.bulk_index(vec![c], Utc::now()).await.unwrap();

        let page = Page {
            document_version_id: version_id,
            page_number: 1,
            image_key: "k".to_string(),
            ocr_json_key: None,
            text: "reset the device".to_string(),
            avg_confidence: 0.9,
            bboxes: vec![
                BBoxSpan { text: "reset".to_string(), confidence: 0.5, bbox: BBox::new(0.0, 0.0, 1.0, 1.0).unwrap() },
                BBoxSpan { text: "unrelated".to_string(), confidence: 0.99, bbox: BBox::new(1.0, 1.0, 2.0, 2.0).unwrap() },
                BBoxSpan { text: "device reset".to_string(), confidence: 0.8, bbox: BBox::new(2.0, 2.0, 3.0, 3.0).unwrap() },
            ],
            vlm_failed: false,
        };
        metadata.put_page(page).await.unwrap();

        let hits = orchestrator.search(&AuthContext::anonymous(), request("reset", 10)).await.unwrap();
        assert_eq!(hits.len(), 1);
        let bboxes = &hits[0].bbox_matches;
        assert_eq!(bboxes.len(), 2);
        assert_eq!(bboxes[0].text, "device reset");
        assert_eq!(bboxes[1].text, "reset");
    }
}
