use async_trait::async_trait;

use crate::capability::FileKind;
use crate::RenderError;

/// A finite, ordered sequence of page byte buffers produced by the
/// headless converter, ready to re-enter the PDF path (spec §4.5:
/// "word/presentation/spreadsheet first route through a headless
/// converter to a paginated intermediate, then use the pdf path").
#[derive(Debug, Clone)]
pub struct PagedIntermediate {
    pub pages: Vec<Vec<u8>>,
}

/// Capability boundary for the office-to-PDF conversion step; the real
/// converter (e.g. a headless LibreOffice worker) is an external
/// collaborator per §1, so this crate only defines the interface.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, bytes: &[u8], kind: FileKind) -> Result<PagedIntermediate, RenderError>;
}

/// Splits on form-feed (`\x0c`) as a page boundary, falling back to a
/// single page when the source carries none; a deterministic stand-in
/// that lets pipeline tests exercise the office-format path without a
/// real converter process.
pub struct NaiveDocumentConverter;

#[async_trait]
impl DocumentConverter for NaiveDocumentConverter {
    async fn convert(&self, bytes: &[u8], kind: FileKind) -> Result<PagedIntermediate, RenderError> {
        if !kind.routes_through_converter() {
            return Err(RenderError::UnsupportedFileType(format!("{kind:?} does not route through a converter")));
        }
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        let pages: Vec<Vec<u8>> = bytes
            .split(|b| *b == 0x0c)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(PagedIntermediate { pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_on_form_feed() {
        let converter = NaiveDocumentConverter;
        let bytes = b"page one\x0cpage two\x0cpage three".to_vec();
        let intermediate = converter.convert(&bytes, FileKind::Word).await.unwrap();
        assert_eq!(intermediate.pages.len(), 3);
        assert_eq!(intermediate.pages[1], b"page two");
    }

    #[tokio::test]
    async fn rejects_kinds_that_do_not_route_through_converter() {
        let converter = NaiveDocumentConverter;
        let err = converter.convert(b"x", FileKind::Pdf).await.unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedFileType(_)));
    }
}
