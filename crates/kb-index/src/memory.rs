use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kb_core::Chunk;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::query::{CompoundQuery, IndexHit, MustClause, ShouldClause};
use crate::IndexError;
use crate::IndexStore;

struct IndexedChunk {
    chunk: Chunk,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryIndexStore {
    chunks: RwLock<HashMap<String, IndexedChunk>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Unweighted term-overlap ratio between the query and one field's text,
/// standing in for a real BM25 computation: a pure-Rust approximation in
/// place of an external lexical engine.
fn term_overlap_score(query_tokens: &[String], field_text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let field_tokens: Vec<String> = tokenize(field_text);
    if field_tokens.is_empty() {
        return 0.0;
    }
    let matches = query_tokens
        .iter()
        .filter(|qt| field_tokens.iter().any(|ft| ft == *qt))
        .count();
    matches as f32 / query_tokens.len() as f32
}

fn field_value(chunk: &Chunk, field: &str) -> Option<String> {
    match field {
        "text" => Some(chunk.text.clone()),
        "metadata.filename" => Some(chunk.metadata.filename.clone()),
        "metadata.filepath" => chunk.metadata.filepath.clone(),
        "metadata.page_number" => Some(chunk.page_number.to_string()),
        "metadata.document_id" => Some(chunk.metadata.document_id.to_string()),
        "metadata.owner_id" => chunk.metadata.owner_id.map(|id| id.to_string()),
        "metadata.org_id" => chunk.metadata.org_id.map(|id| id.to_string()),
        "metadata.visibility" => Some(format!("{:?}", chunk.metadata.visibility)),
        "metadata.checksum" => Some(chunk.metadata.checksum.clone()),
        "metadata.file_type" => Some(chunk.metadata.file_type.clone()),
        "metadata.shared_with_users" => Some(
            chunk
                .metadata
                .shared_with_users
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(","),
        ),
        "metadata.shared_with_roles" => Some(
            chunk
                .metadata
                .shared_with_roles
                .iter()
                .map(|r| r.as_str().to_string())
                .collect::<Vec<_>>()
                .join(","),
        ),
        _ => None,
    }
}

fn must_matches(chunk: &Chunk, clause: &MustClause) -> bool {
    match clause {
        MustClause::Term { field, value } => {
            field_value(chunk, field).as_deref() == Some(value.as_str())
        }
        MustClause::Terms { field, values } => field_value(chunk, field)
            .map(|v| values.iter().any(|candidate| candidate == &v))
            .unwrap_or(false),
        MustClause::Wildcard { field, pattern } => field_value(chunk, field)
            .map(|v| wildcard_match(&v.to_lowercase(), &pattern.to_lowercase()))
            .unwrap_or(false),
        MustClause::AnyOf(clauses) => clauses.iter().any(|c| must_matches(chunk, c)),
        MustClause::AllOf(clauses) => clauses.iter().all(|c| must_matches(chunk, c)),
        MustClause::Contains { field, value } => field_value(chunk, field)
            .map(|v| v.split(',').any(|member| member == value))
            .unwrap_or(false),
        MustClause::ContainsAny { field, values } => field_value(chunk, field)
            .map(|v| {
                let members: Vec<&str> = v.split(',').collect();
                values.iter().any(|candidate| members.contains(&candidate.as_str()))
            })
            .unwrap_or(false),
    }
}

/// `*` only, case-insensitive, matched against the whole field value.
fn wildcard_match(value: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return value == pattern;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut cursor = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match value[cursor..].find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                cursor += pos + part.len();
            }
            None => return false,
        }
    }
    if let Some(last) = parts.last() {
        if !last.is_empty() && !pattern.ends_with('*') {
            return value.ends_with(last);
        }
    }
    true
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn bulk_index(&self, chunks: Vec<Chunk>, updated_at: DateTime<Utc>) -> Result<(), IndexError> {
        let mut table = self.chunks.write().await;
        for chunk in chunks {
            table.insert(
                chunk.chunk_id.clone(),
                IndexedChunk { chunk, updated_at },
            );
        }
        Ok(())
    }

    async fn delete_by_version(&self, version_id: Uuid) -> Result<(), IndexError> {
        self.chunks
            .write()
            .await
            .retain(|_, indexed| indexed.chunk.version_id != version_id);
        Ok(())
    }

    async fn chunk_ids_for_version(&self, version_id: Uuid) -> Result<Vec<String>, IndexError> {
        Ok(self
            .chunks
            .read()
            .await
            .values()
            .filter(|indexed| indexed.chunk.version_id == version_id)
            .map(|indexed| indexed.chunk.chunk_id.clone())
            .collect())
    }

    async fn chunks_for_version(&self, version_id: Uuid) -> Result<Vec<Chunk>, IndexError> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .read()
            .await
            .values()
            .filter(|indexed| indexed.chunk.version_id == version_id)
            .map(|indexed| indexed.chunk.clone())
            .collect();
        chunks.sort_by_key(|chunk| (chunk.page_number, chunk.local_index));
        Ok(chunks)
    }

    async fn indexed_version_ids(&self) -> Result<Vec<Uuid>, IndexError> {
        let ids: std::collections::BTreeSet<Uuid> =
            self.chunks.read().await.values().map(|indexed| indexed.chunk.version_id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn query(&self, query: CompoundQuery) -> Result<Vec<IndexHit>, IndexError> {
        let table = self.chunks.read().await;
        let mut hits: Vec<IndexHit> = Vec::new();

        for indexed in table.values() {
            let chunk = &indexed.chunk;
            if !query.must.iter().all(|clause| must_matches(chunk, clause)) {
                continue;
            }

            let mut score = 0.0f32;
            let mut satisfied_should = 0u32;
            let mut matched_query_tokens: Vec<String> = Vec::new();

            for clause in &query.should {
                match clause {
                    ShouldClause::ScriptScoreVector { vector, weight } => {
                        if let Some(chunk_vector) = &chunk.vector {
                            let sim = cosine_similarity(vector, chunk_vector);
                            if sim > 0.0 {
                                satisfied_should += 1;
                            }
                            score += sim * weight;
                        }
                    }
                    ShouldClause::MultiMatch {
                        query_text,
                        fields,
                        weight,
                    } => {
                        let tokens = tokenize(query_text);
                        matched_query_tokens = tokens.clone();
                        let mut field_score = 0.0f32;
                        for (field, field_weight) in fields {
                            if let Some(value) = field_value(chunk, field) {
                                field_score += term_overlap_score(&tokens, &value) * field_weight;
                            }
                        }
                        if field_score > 0.0 {
                            satisfied_should += 1;
                        }
                        score += field_score * weight;
                    }
                }
            }

            if !query.should.is_empty() && satisfied_should < query.minimum_should_match.max(1) {
                continue;
            }

            if let Some(min_score) = query.min_score {
                if score < min_score {
                    continue;
                }
            }

            let highlighted = if !matched_query_tokens.is_empty()
                && matched_query_tokens
                    .iter()
                    .any(|t| chunk.text.to_lowercase().contains(t.as_str()))
            {
                Some(highlight_fragment(&chunk.text, &matched_query_tokens))
            } else {
                None
            };

            hits.push(IndexHit {
                chunk_id: chunk.chunk_id.clone(),
                version_id: chunk.version_id,
                page_number: chunk.page_number,
                score,
                text: chunk.text.clone(),
                highlighted,
                metadata: chunk.metadata.clone(),
                updated_at: indexed.updated_at,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.page_number.cmp(&b.page_number))
        });
        hits.truncate(query.size);
        Ok(hits)
    }
}

fn highlight_fragment(text: &str, tokens: &[String]) -> String {
    let mut out = String::new();
    for word in text.split_whitespace() {
        let lower = word.to_lowercase();
        if tokens.iter().any(|t| lower.contains(t.as_str())) {
            out.push_str("**");
            out.push_str(word);
            out.push_str("**");
        } else {
            out.push_str(word);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}
