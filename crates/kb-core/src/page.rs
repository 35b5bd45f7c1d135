use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(x1,y1,x2,y2)` with `x1<x2, y1<y2`, enforced by [`BBox::new`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
        if x1 < x2 && y1 < y2 {
            Some(BBox { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One OCR/native text span with its bounding box and confidence, ordered
/// within a page by the tie-break rule in spec §4.7 (top-to-bottom by
/// center y, then left-to-right by center x).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBoxSpan {
    pub text: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Tie-break ordering used when sorting overlapping OCR boxes.
pub fn bbox_span_order(a: &BBoxSpan, b: &BBoxSpan) -> std::cmp::Ordering {
    let (ax, ay) = a.bbox.center();
    let (bx, by) = b.bbox.center();
    ay.partial_cmp(&by)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(ax.partial_cmp(&bx).unwrap_or(std::cmp::Ordering::Equal))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub document_version_id: Uuid,
    pub page_number: u32,
    pub image_key: String,
    pub ocr_json_key: Option<String>,
    pub text: String,
    pub avg_confidence: f32,
    pub bboxes: Vec<BBoxSpan>,
    /// Set when an OCR/VLM stage tolerated a VLM failure and retained the
    /// raw OCR result instead (spec §4.7 edge policies).
    pub vlm_failed: bool,
}

impl Page {
    pub fn is_empty_page(&self) -> bool {
        self.text.trim().is_empty()
    }
}
