//! Render/OCR Capabilities (C5): a `FileKind`-dispatched `render_pages`
//! capability producing ordered page images plus optional native
//! text/bboxes, built around a `RenderManifest` describing per-kind
//! support level. OCR engines and office-to-page converters are narrow
//! external capability interfaces per spec §1 and are not given a "real"
//! implementation here, only a deterministic reference one, the same way
//! `kb_models::MockModelGateway` stands in for a live model endpoint.

pub mod capability;
pub mod converter;
pub mod ocr;
pub mod renderers;

pub use capability::{ChildUpload, FileKind, RenderManifest, RenderOutput, RenderedPage, SupportLevel};
pub use converter::{DocumentConverter, NaiveDocumentConverter, PagedIntermediate};
pub use ocr::{MockOcrEngine, OcrEngine, OcrError};
pub use renderers::{
    ArchiveRenderCapability, ImageRenderCapability, OfficeRenderCapability, PdfRenderCapability,
    RenderCapability, TextRenderCapability,
};

use kb_error::{ErrorCode, KbError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("unparseable document: {0}")]
    Unparseable(String),
    #[error("empty document")]
    Empty,
}

impl From<RenderError> for KbError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::UnsupportedFileType(kind) => {
                KbError::new(ErrorCode::UnsupportedFileType, format!("unsupported file type: {kind}"))
            }
            RenderError::Unparseable(msg) => KbError::new(ErrorCode::UnsupportedFileType, msg),
            RenderError::Empty => KbError::new(ErrorCode::EmptyDocument, "document has no pages"),
        }
    }
}

/// Resolves a [`FileKind`] to its [`RenderCapability`], the single place
/// `kb-pipeline`'s Render stage needs to know about to dispatch without a
/// runtime type-switch of its own (spec §9 "dynamic per-format handlers
/// become a tagged variant with a single `render_pages` capability").
pub struct CapabilityRegistry {
    archive: ArchiveRenderCapability,
    pdf: PdfRenderCapability,
    text: TextRenderCapability,
    image: ImageRenderCapability,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        CapabilityRegistry {
            archive: ArchiveRenderCapability,
            pdf: PdfRenderCapability,
            text: TextRenderCapability,
            image: ImageRenderCapability,
        }
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest_for(&self, kind: FileKind) -> RenderManifest {
        kind.manifest()
    }

    pub async fn render(&self, kind: FileKind, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        match kind {
            FileKind::Pdf => self.pdf.render_pages(bytes).await,
            FileKind::Text => self.text.render_pages(bytes).await,
            FileKind::Image => self.image.render_pages(bytes).await,
            FileKind::Archive => self.archive.render_pages(bytes).await,
            FileKind::Word | FileKind::Presentation | FileKind::Spreadsheet => {
                OfficeRenderCapability::with_naive_converter(kind).render_pages(bytes).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_dispatches_by_file_kind() {
        let registry = CapabilityRegistry::new();
        let output = registry.render(FileKind::Pdf, b"one\x0ctwo").await.unwrap();
        assert_eq!(output.pages.len(), 2);

        let output = registry.render(FileKind::Image, b"\x89PNG...").await.unwrap();
        assert_eq!(output.pages.len(), 1);
        assert!(output.pages[0].native_text.is_none());
    }

    #[tokio::test]
    async fn registry_rejects_empty_archive_as_empty_document() {
        let registry = CapabilityRegistry::new();
        let err = registry.render(FileKind::Pdf, b"").await.unwrap_err();
        let kb_err: KbError = err.into();
        assert_eq!(kb_err.code, ErrorCode::EmptyDocument);
    }
}
