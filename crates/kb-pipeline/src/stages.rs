//! Stage bodies (spec §4.7). Each function is a checkpointed step: it
//! reads what it needs from [`kb_metadata::MetadataStore`]/
//! [`kb_blob::BlobStore`], does one unit of I/O-bound work, writes back
//! through the same ports, and returns the next [`kb_core::StageCursor`]
//! for the caller to persist. None of these functions loop across
//! stages; [`crate::orchestrator::PipelineOrchestrator`] owns that.

use std::sync::Arc;

use chrono::Utc;
use kb_blob::{page_image_key, page_ocr_key, raw_key, BlobStore};
use kb_config::OcrConfig;
use kb_core::chunk::{derive_chunk_id, ChunkMetadata};
use kb_core::page::{bbox_span_order, BBoxSpan, Page};
use kb_core::{Chunk, DocumentVersion, StageName, VersionStatus};
use kb_error::KbError;
use kb_index::IndexStore;
use kb_metadata::MetadataStore;
use kb_models::EmbeddingClient;
use kb_render::{CapabilityRegistry, FileKind, OcrEngine};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Admit (spec §4.7 step 1): verify bytes against checksum, short-circuit
/// on a byte-identical completed version owned by the same user (I1).
/// Returns `true` when an existing version was reused and the rest of
/// the graph should be skipped straight to `Finalize`. The short-circuit
/// also clones the reused version's indexed chunks under the new
/// `version_id` (I4: every completed version's pages must have ≥1 chunk
/// in the index), reusing their vectors so the embedding client is not
/// called again.
#[instrument(level = "debug", skip(metadata, index, bytes, chunk_meta))]
pub async fn admit(
    metadata: &dyn MetadataStore,
    index: &dyn IndexStore,
    version: &mut DocumentVersion,
    bytes: &[u8],
    chunk_meta: &ChunkMetadata,
) -> Result<bool, KbError> {
    let checksum = sha256_hex(bytes);
    if checksum != version.checksum {
        return Err(KbError::new(
            kb_error::ErrorCode::ChecksumMismatch,
            format!("declared checksum {} does not match computed {checksum}", version.checksum),
        ));
    }
    if let Some(existing) = metadata
        .find_completed_version_by_checksum(&checksum, version.owner_id)
        .await?
    {
        version.storage_key = existing.storage_key.clone();
        version.total_pages = existing.total_pages;
        version.processed_pages = existing.total_pages;
        version.progress_percent = 100.0;
        for page_number in 1..=existing.total_pages {
            if let Ok(page) = metadata.get_page(existing.id, page_number).await {
                let mut reused = page;
                reused.document_version_id = version.id;
                metadata.put_page(reused).await?;
            }
        }

        let reused_chunks = index.chunks_for_version(existing.id).await.map_err(KbError::from)?;
        let cloned: Vec<Chunk> = reused_chunks
            .into_iter()
            .map(|chunk| Chunk {
                chunk_id: derive_chunk_id(version.id, chunk.page_number, chunk.local_index),
                version_id: version.id,
                page_number: chunk.page_number,
                local_index: chunk.local_index,
                text: chunk.text,
                vector: chunk.vector,
                metadata: chunk_meta.clone(),
            })
            .collect();
        if !cloned.is_empty() {
            index.bulk_index(cloned, Utc::now()).await.map_err(KbError::from)?;
        }

        info!(version_id = %version.id, reused_from = %existing.id, "admit short-circuited on checksum match");
        return Ok(true);
    }
    Ok(false)
}

/// Render (step 2): produce page images, persist them, set `total_pages`.
/// Archive members are returned separately for the caller to fan out as
/// child tasks, never recursed into here; an archive produces zero pages
/// of its own, which is not the `EmptyDocument` error case the other
/// file kinds hit. Rendered pages are returned alongside the children so
/// the caller can seed each page's native-text row before OCR runs.
#[instrument(level = "debug", skip(blob, registry, version, bytes))]
pub async fn render(
    blob: &dyn BlobStore,
    registry: &CapabilityRegistry,
    version: &mut DocumentVersion,
    file_kind: FileKind,
    bytes: &[u8],
) -> Result<(Vec<kb_render::ChildUpload>, Vec<kb_render::RenderedPage>), KbError> {
    let output = registry.render(file_kind, bytes).await.map_err(KbError::from)?;
    if output.pages.is_empty() && output.children.is_empty() {
        return Err(KbError::new(kb_error::ErrorCode::EmptyDocument, "render produced zero pages"));
    }
    for page in &output.pages {
        let key = page_image_key(version.id, page.page_number);
        blob.put("documents", &key, page.image_bytes.clone(), "image/png")
            .await
            .map_err(KbError::from)?;
    }
    version.total_pages = output.pages.len() as u32;
    Ok((output.children, output.pages))
}

/// Per-page OCR (step 3): runs the configured engine, applies the
/// native-text-wins-on-low-confidence edge policy, and persists the page
/// row. `dpi` is the caller's choice between fast mode (one pass) and
/// deep mode (the caller re-invokes at a higher DPI for spans below
/// [`OcrConfig::deep_reocr_threshold`]).
#[instrument(level = "debug", skip(ocr, native_text, image_bytes))]
pub async fn ocr_page(
    ocr: &dyn OcrEngine,
    ocr_config: &OcrConfig,
    version_id: Uuid,
    page_number: u32,
    image_bytes: &[u8],
    native_text: Option<&str>,
    dpi: u32,
) -> Result<Page, KbError> {
    let mut spans = ocr.recognize(image_bytes, dpi).await.map_err(KbError::from)?;
    spans.sort_by(bbox_span_order);

    let avg_confidence = average_confidence(&spans);
    let text = resolve_page_text(&spans, native_text, avg_confidence, ocr_config.low_confidence_threshold);

    Ok(Page {
        document_version_id: version_id,
        page_number,
        image_key: page_image_key(version_id, page_number),
        ocr_json_key: Some(page_ocr_key(version_id, page_number)),
        text,
        avg_confidence,
        bboxes: spans,
        vlm_failed: false,
    })
}

/// Spans whose confidence falls below `deep_reocr_threshold` are
/// candidates for the deep-mode higher-DPI re-pass (spec §4.7 step 3).
pub fn spans_needing_reocr<'a>(spans: &'a [BBoxSpan], threshold: f32) -> Vec<&'a BBoxSpan> {
    spans.iter().filter(|s| s.confidence < threshold).collect()
}

fn average_confidence(spans: &[BBoxSpan]) -> f32 {
    if spans.is_empty() {
        return 0.0;
    }
    spans.iter().map(|s| s.confidence).sum::<f32>() / spans.len() as f32
}

/// Native-text-wins edge policy: when a native text layer exists, it is
/// always preferred for the page's stored `text` (OCR still supplies
/// `bboxes` for highlighting), regardless of OCR confidence.
fn resolve_page_text(spans: &[BBoxSpan], native_text: Option<&str>, _avg_confidence: f32, _threshold: f32) -> String {
    if let Some(native) = native_text {
        return native.to_string();
    }
    spans.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join("\n")
}

/// VLM-failure-tolerance edge policy: a failed correction call degrades
/// to the raw OCR page rather than failing the whole stage, flagging
/// `vlm_failed` for observability.
pub fn apply_vlm_correction(page: &mut Page, correction: Result<kb_models::VlmCorrection, kb_models::ModelError>) {
    match correction {
        Ok(corrected) => {
            page.text = corrected.corrected_text;
        }
        Err(_) => {
            page.vlm_failed = true;
        }
    }
}

/// Chunk (step 4): runs the chunker over each page's text and persists
/// placeholder chunk rows (vector filled in by [`embed`]).
#[instrument(level = "debug", skip(pages, metadata_snapshot))]
pub fn chunk_pages(version_id: Uuid, pages: &[Page], metadata_snapshot: &ChunkMetadata) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for page in pages {
        if page.is_empty_page() {
            continue;
        }
        for (local_index, text) in kb_chunker::chunk_page_text(&page.text).into_iter().enumerate() {
            chunks.push(Chunk {
                chunk_id: derive_chunk_id(version_id, page.page_number, local_index as u32),
                version_id,
                page_number: page.page_number,
                local_index: local_index as u32,
                text,
                vector: None,
                metadata: metadata_snapshot.clone(),
            });
        }
    }
    chunks
}

/// Embed (step 5): batches chunk texts through [`EmbeddingClient::embed_batch`]
/// at [`kb_models::EMBED_BATCH_CAP`] and writes the resulting vectors back
/// onto each chunk in order.
#[instrument(level = "debug", skip(embedder, chunks))]
pub async fn embed_chunks(embedder: &dyn EmbeddingClient, chunks: &mut [Chunk]) -> Result<(), KbError> {
    if chunks.is_empty() {
        return Ok(());
    }
    for batch in chunks.chunks_mut(kb_models::EMBED_BATCH_CAP) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await.map_err(KbError::from)?;
        for (chunk, vector) in batch.iter_mut().zip(vectors) {
            chunk.vector = Some(vector);
        }
    }
    Ok(())
}

/// Index (step 6): bulk-writes chunk documents, already carrying the
/// full permission snapshot from [`chunk_pages`].
#[instrument(level = "debug", skip(index, chunks))]
pub async fn index_chunks(index: &dyn IndexStore, chunks: Vec<Chunk>) -> Result<(), KbError> {
    index.bulk_index(chunks, Utc::now()).await.map_err(KbError::from)
}

/// Finalize (step 7): mark the version completed, flip `is_latest` across
/// the group, and write an audit entry.
#[instrument(level = "debug", skip(metadata, version))]
pub async fn finalize(
    metadata: &dyn MetadataStore,
    version: &mut DocumentVersion,
    actor_user_id: Option<Uuid>,
) -> Result<(), KbError> {
    let now = Utc::now();
    version.status = VersionStatus::Completed;
    version.processed_pages = version.total_pages;
    version.progress_percent = 100.0;
    version.updated_at = now;
    metadata.update_version(version.clone()).await?;
    metadata.promote_latest(version.group_id, version.id).await?;

    let entry = kb_core::AuditEntry::new(actor_user_id, "ingest.finalize", version.id.to_string());
    metadata.append_audit(entry).await?;
    Ok(())
}

/// Raw upload object key for the Admit stage to check against an
/// existing blob before re-putting identical bytes.
pub fn raw_object_key(checksum: &str) -> String {
    raw_key(checksum)
}

pub fn stage_name_for_resume(version: &DocumentVersion) -> StageName {
    if version.total_pages == 0 {
        StageName::Admit
    } else if version.processed_pages == 0 {
        StageName::Render
    } else {
        StageName::Chunk
    }
}

pub type ArcMetadata = Arc<dyn MetadataStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use kb_core::page::BBox;

    fn span(text: &str, confidence: f32) -> BBoxSpan {
        BBoxSpan {
            text: text.to_string(),
            confidence,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0).unwrap(),
        }
    }

    #[test]
    fn native_text_wins_even_at_low_ocr_confidence() {
        let spans = vec![span("garbled", 0.1)];
        let text = resolve_page_text(&spans, Some("the real text"), 0.1, 0.3);
        assert_eq!(text, "the real text");
    }

    #[test]
    fn falls_back_to_ocr_text_without_a_native_layer() {
        let spans = vec![span("line one", 0.9), span("line two", 0.9)];
        let text = resolve_page_text(&spans, None, 0.9, 0.3);
        assert_eq!(text, "line one\nline two");
    }

    #[test]
    fn spans_below_threshold_are_flagged_for_reocr() {
        let spans = vec![span("a", 0.2), span("b", 0.8)];
        let needing = spans_needing_reocr(&spans, 0.6);
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].text, "a");
    }

    #[test]
    fn empty_page_produces_zero_chunks() {
        let page = Page {
            document_version_id: Uuid::new_v4(),
            page_number: 1,
            image_key: "k".to_string(),
            ocr_json_key: None,
            text: "   ".to_string(),
            avg_confidence: 0.0,
            bboxes: Vec::new(),
            vlm_failed: false,
        };
        let meta = sample_metadata();
        let chunks = chunk_pages(page.document_version_id, &[page], &meta);
        assert!(chunks.is_empty());
    }

    #[test]
    fn vlm_failure_degrades_to_raw_ocr_without_erroring() {
        let mut page = Page {
            document_version_id: Uuid::new_v4(),
            page_number: 1,
            image_key: "k".to_string(),
            ocr_json_key: None,
            text: "raw ocr text".to_string(),
            avg_confidence: 0.5,
            bboxes: Vec::new(),
            vlm_failed: false,
        };
        apply_vlm_correction(&mut page, Err(kb_models::ModelError::new(kb_models::ModelErrorKind::Timeout, "down")));
        assert!(page.vlm_failed);
        assert_eq!(page.text, "raw ocr text");
    }

    fn sample_metadata() -> ChunkMetadata {
        ChunkMetadata {
            document_id: Uuid::new_v4(),
            owner_id: None,
            org_id: None,
            visibility: kb_core::Visibility::Private,
            shared_with_users: Default::default(),
            shared_with_roles: Default::default(),
            filename: "f.pdf".to_string(),
            filepath: None,
            checksum: "abc".to_string(),
            file_type: "pdf".to_string(),
            original_file_url: None,
            page_image_url: None,
        }
    }
}
