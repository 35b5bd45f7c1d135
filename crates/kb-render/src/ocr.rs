use async_trait::async_trait;
use kb_core::page::BBoxSpan;
use kb_error::{ErrorCode, KbError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("ocr engine unavailable: {0}")]
    Unavailable(String),
    #[error("ocr engine returned malformed output: {0}")]
    BadOutput(String),
}

impl From<OcrError> for KbError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::Unavailable(msg) => KbError::new(ErrorCode::Unavailable, msg),
            OcrError::BadOutput(msg) => KbError::new(ErrorCode::BadResponse, msg),
        }
    }
}

/// External OCR capability per spec §4.5: given a page image, return
/// `[{text, bbox, confidence}]`. Two engines are configurable; the choice
/// is per-upload (carried as `engine` on the ingest task, not here).
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// `dpi` lets the deep-mode re-OCR pass request a higher-resolution
    /// rasterization for low-confidence regions (spec §4.7 step 3).
    async fn recognize(&self, page_image: &[u8], dpi: u32) -> Result<Vec<BBoxSpan>, OcrError>;
}

/// Deterministic, hash-free mock engine used by pipeline tests, the same
/// role `kb_models::MockModelGateway` plays for the embedding/VLM calls:
/// it treats the page image bytes as UTF-8 text (tests feed it synthetic
/// "image" buffers) and returns one span per non-empty line, with a
/// confidence that improves at higher DPI to exercise the deep-mode
/// re-OCR trigger.
pub struct MockOcrEngine {
    name: String,
}

impl MockOcrEngine {
    pub fn new(name: impl Into<String>) -> Self {
        MockOcrEngine { name: name.into() }
    }
}

impl Default for MockOcrEngine {
    fn default() -> Self {
        MockOcrEngine::new("mock-ocr")
    }
}

#[async_trait]
impl OcrEngine for MockOcrEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, page_image: &[u8], dpi: u32) -> Result<Vec<BBoxSpan>, OcrError> {
        let text = String::from_utf8_lossy(page_image);
        let base_confidence = if dpi >= 600 { 0.95 } else { 0.55 };
        let mut spans = Vec::new();
        for (row, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let y1 = row as f32 * 20.0;
            let bbox = kb_core::page::BBox::new(0.0, y1, line.len().max(1) as f32, y1 + 18.0)
                .ok_or_else(|| OcrError::BadOutput("degenerate bbox".to_string()))?;
            spans.push(BBoxSpan {
                text: line.to_string(),
                confidence: base_confidence,
                bbox,
            });
        }
        Ok(spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_dpi_yields_higher_confidence() {
        let engine = MockOcrEngine::default();
        let low = engine.recognize(b"hello world", 150).await.unwrap();
        let high = engine.recognize(b"hello world", 600).await.unwrap();
        assert!(high[0].confidence > low[0].confidence);
    }

    #[tokio::test]
    async fn blank_lines_produce_no_spans() {
        let engine = MockOcrEngine::default();
        let spans = engine.recognize(b"\n\n   \n", 150).await.unwrap();
        assert!(spans.is_empty());
    }
}
