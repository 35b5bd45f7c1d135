use kb_core::page::BBoxSpan;
use uuid::Uuid;

/// Three-way capability classification: does this file kind carry its
/// own text/bbox layer natively, can one be synthesized with a fallback
/// strategy, or is it unsupported outright.
#[derive(Debug, Clone, PartialEq)]
pub enum SupportLevel {
    Native,
    Emulated { strategy: String },
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderManifest {
    pub native_text: SupportLevel,
    pub native_bboxes: SupportLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Pdf,
    Word,
    Presentation,
    Spreadsheet,
    Text,
    Image,
    Archive,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Option<FileKind> {
        match ext.to_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "doc" | "docx" | "odt" | "rtf" => Some(FileKind::Word),
            "ppt" | "pptx" | "odp" => Some(FileKind::Presentation),
            "xls" | "xlsx" | "ods" | "csv" => Some(FileKind::Spreadsheet),
            "txt" | "md" | "markdown" => Some(FileKind::Text),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" => Some(FileKind::Image),
            "zip" => Some(FileKind::Archive),
            _ => None,
        }
    }

    /// Per spec §4.5: office formats route through a converter to a
    /// paginated intermediate before reusing the PDF path; PDF, text,
    /// image and archive are handled directly.
    pub fn routes_through_converter(&self) -> bool {
        matches!(
            self,
            FileKind::Word | FileKind::Presentation | FileKind::Spreadsheet
        )
    }

    pub fn manifest(&self) -> RenderManifest {
        match self {
            FileKind::Pdf => RenderManifest {
                native_text: SupportLevel::Native,
                native_bboxes: SupportLevel::Emulated {
                    strategy: "ocr-fallback".to_string(),
                },
            },
            FileKind::Word | FileKind::Presentation | FileKind::Spreadsheet => RenderManifest {
                native_text: SupportLevel::Emulated {
                    strategy: "converted-to-pdf".to_string(),
                },
                native_bboxes: SupportLevel::Emulated {
                    strategy: "ocr-fallback".to_string(),
                },
            },
            FileKind::Text => RenderManifest {
                native_text: SupportLevel::Native,
                native_bboxes: SupportLevel::Unsupported,
            },
            FileKind::Image => RenderManifest {
                native_text: SupportLevel::Unsupported,
                native_bboxes: SupportLevel::Unsupported,
            },
            FileKind::Archive => RenderManifest {
                native_text: SupportLevel::Unsupported,
                native_bboxes: SupportLevel::Unsupported,
            },
        }
    }
}

/// One page produced by a [`crate::RenderCapability`]: finite and
/// not restartable, per spec §4.5.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_number: u32,
    pub image_bytes: Vec<u8>,
    pub native_text: Option<String>,
    pub native_bboxes: Option<Vec<BBoxSpan>>,
}

/// An archive member dispatched as a dependent ingest task, linked to
/// its parent by `parent_group_id`.
#[derive(Debug, Clone)]
pub struct ChildUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub file_kind: FileKind,
    pub parent_group_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub pages: Vec<RenderedPage>,
    pub children: Vec<ChildUpload>,
}

impl RenderOutput {
    pub fn pages_only(pages: Vec<RenderedPage>) -> Self {
        RenderOutput {
            pages,
            children: Vec::new(),
        }
    }
}
