use std::io::{Cursor, Read};

use async_trait::async_trait;

use crate::capability::{ChildUpload, FileKind, RenderOutput, RenderedPage};
use crate::converter::{DocumentConverter, NaiveDocumentConverter};
use crate::RenderError;

/// Per-format capability from spec §4.5: produces an ordered, finite,
/// not-restartable sequence of pages, optionally expanding to dependent
/// child uploads (archive only).
#[async_trait]
pub trait RenderCapability: Send + Sync {
    fn file_kind(&self) -> FileKind;
    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError>;
}

fn pages_from_form_feed(bytes: &[u8]) -> Vec<RenderedPage> {
    bytes
        .split(|b| *b == 0x0c)
        .enumerate()
        .map(|(i, chunk)| RenderedPage {
            page_number: i as u32 + 1,
            image_bytes: chunk.to_vec(),
            native_text: Some(String::from_utf8_lossy(chunk).into_owned()),
            native_bboxes: None,
        })
        .collect()
}

/// PDF has a native text layer but no native bbox layer (bboxes always
/// come from OCR, per `FileKind::Pdf::manifest`). The real rasterizer is
/// an external capability (§1); this implementation treats the upload as
/// already page-delimited, the same placeholder convention
/// `kb_render::converter::NaiveDocumentConverter` uses for office
/// formats.
pub struct PdfRenderCapability;

#[async_trait]
impl RenderCapability for PdfRenderCapability {
    fn file_kind(&self) -> FileKind {
        FileKind::Pdf
    }

    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        Ok(RenderOutput::pages_only(pages_from_form_feed(bytes)))
    }
}

/// Plain text / Markdown: native text only, never native bboxes (per
/// `FileKind::Text::manifest`), one page per form-feed-delimited chunk
/// (a single page for ordinary text files).
pub struct TextRenderCapability;

#[async_trait]
impl RenderCapability for TextRenderCapability {
    fn file_kind(&self) -> FileKind {
        FileKind::Text
    }

    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RenderError::Unparseable(format!("not valid utf-8: {e}")))?;
        Ok(RenderOutput::pages_only(vec![RenderedPage {
            page_number: 1,
            image_bytes: Vec::new(),
            native_text: Some(text.to_string()),
            native_bboxes: None,
        }]))
    }
}

/// A bare image carries neither native text nor native bboxes; the whole
/// buffer becomes the page image and is OCR'd downstream.
pub struct ImageRenderCapability;

#[async_trait]
impl RenderCapability for ImageRenderCapability {
    fn file_kind(&self) -> FileKind {
        FileKind::Image
    }

    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        Ok(RenderOutput::pages_only(vec![RenderedPage {
            page_number: 1,
            image_bytes: bytes.to_vec(),
            native_text: None,
            native_bboxes: None,
        }]))
    }
}

/// Word/presentation/spreadsheet: routes through a [`DocumentConverter`]
/// to a [`crate::converter::PagedIntermediate`], then reuses the PDF
/// path, per spec §4.5.
pub struct OfficeRenderCapability {
    kind: FileKind,
    converter: Box<dyn DocumentConverter>,
}

impl OfficeRenderCapability {
    pub fn new(kind: FileKind, converter: Box<dyn DocumentConverter>) -> Self {
        OfficeRenderCapability { kind, converter }
    }

    pub fn with_naive_converter(kind: FileKind) -> Self {
        OfficeRenderCapability::new(kind, Box::new(NaiveDocumentConverter))
    }
}

#[async_trait]
impl RenderCapability for OfficeRenderCapability {
    fn file_kind(&self) -> FileKind {
        self.kind
    }

    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        let intermediate = self.converter.convert(bytes, self.kind).await?;
        let pages = intermediate
            .pages
            .into_iter()
            .enumerate()
            .map(|(i, page_bytes)| RenderedPage {
                page_number: i as u32 + 1,
                native_text: Some(String::from_utf8_lossy(&page_bytes).into_owned()),
                image_bytes: page_bytes,
                native_bboxes: None,
            })
            .collect();
        Ok(RenderOutput::pages_only(pages))
    }
}

/// Expands to one [`ChildUpload`] per archive member, each dispatched as
/// a dependent ingest task linked to `parent_group_id` (spec §4.5/§4.7
/// scenario 2). Produces no pages of its own.
pub struct ArchiveRenderCapability;

#[async_trait]
impl RenderCapability for ArchiveRenderCapability {
    fn file_kind(&self) -> FileKind {
        FileKind::Archive
    }

    async fn render_pages(&self, bytes: &[u8]) -> Result<RenderOutput, RenderError> {
        let cursor = Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|e| RenderError::Unparseable(format!("not a valid zip archive: {e}")))?;
        if archive.is_empty() {
            return Err(RenderError::Empty);
        }
        let mut children = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| RenderError::Unparseable(format!("corrupt archive entry: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let filename = entry.name().to_string();
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| RenderError::Unparseable(format!("unreadable archive entry {filename}: {e}")))?;
            let extension = filename.rsplit('.').next().unwrap_or_default();
            let file_kind = FileKind::from_extension(extension)
                .ok_or_else(|| RenderError::UnsupportedFileType(filename.clone()))?;
            children.push(ChildUpload {
                filename,
                bytes: buf,
                file_kind,
                parent_group_id: uuid::Uuid::nil(),
            });
        }
        Ok(RenderOutput {
            pages: Vec::new(),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn pdf_renderer_splits_pages_and_carries_native_text() {
        let renderer = PdfRenderCapability;
        let output = renderer
            .render_pages(b"first page\x0csecond page")
            .await
            .unwrap();
        assert_eq!(output.pages.len(), 2);
        assert_eq!(output.pages[0].native_text.as_deref(), Some("first page"));
    }

    #[tokio::test]
    async fn empty_pdf_bytes_is_rejected() {
        let renderer = PdfRenderCapability;
        assert!(matches!(renderer.render_pages(b"").await, Err(RenderError::Empty)));
    }

    #[tokio::test]
    async fn text_renderer_rejects_non_utf8() {
        let renderer = TextRenderCapability;
        let err = renderer.render_pages(&[0xff, 0xfe, 0x00]).await.unwrap_err();
        assert!(matches!(err, RenderError::Unparseable(_)));
    }

    #[tokio::test]
    async fn office_renderer_reuses_pdf_path_via_converter() {
        let renderer = OfficeRenderCapability::with_naive_converter(FileKind::Word);
        let output = renderer.render_pages(b"a\x0cb").await.unwrap();
        assert_eq!(output.pages.len(), 2);
    }

    #[tokio::test]
    async fn archive_renderer_expands_members_into_children() {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
            writer.start_file("report.pdf", options).unwrap();
            writer.write_all(b"hello\x0cworld").unwrap();
            writer.start_file("notes.txt", options).unwrap();
            writer.write_all(b"plain text").unwrap();
            writer.finish().unwrap();
        }
        let renderer = ArchiveRenderCapability;
        let output = renderer.render_pages(&buf).await.unwrap();
        assert_eq!(output.children.len(), 2);
        assert!(output.pages.is_empty());
        assert!(output.children.iter().any(|c| c.filename == "report.pdf" && c.file_kind == FileKind::Pdf));
    }

    #[tokio::test]
    async fn archive_renderer_rejects_empty_zip() {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let writer = zip::ZipWriter::new(cursor);
            writer.finish().unwrap();
        }
        let renderer = ArchiveRenderCapability;
        assert!(matches!(renderer.render_pages(&buf).await, Err(RenderError::Empty)));
    }
}
