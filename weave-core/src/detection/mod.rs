//! detection — geometry and appearance evidence for a single person detection
//!
//! The upstream detector/encoder is a black box: it hands us boxes in frame
//! pixel coordinates plus optional face (ArcFace, 512-d) and body (ReID,
//! 2048-d) embeddings.  Everything here is immutable once produced.

use nalgebra::DVectorView;
use serde::{Deserialize, Serialize};

// ── Bounding boxes ───────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the original frame.
///
/// Serialised as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }
    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

impl From<[f32; 4]> for BBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

// ── Embeddings ───────────────────────────────────────────────────────────────

/// Fixed-dimension appearance vector, L2-normalised on construction so that
/// cosine similarity reduces to a dot product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(l2_normalize(&values))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity in `[-1, 1]`.  Mismatched dimensions (a different
    /// encoder produced one side) compare as 0 rather than panicking.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        if self.0.is_empty() || self.0.len() != other.0.len() {
            return 0.0;
        }
        let a = DVectorView::from_slice(&self.0, self.0.len());
        let b = DVectorView::from_slice(&other.0, other.0.len());
        a.dot(&b).clamp(-1.0, 1.0)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.0
    }
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    if v.is_empty() {
        return Vec::new();
    }
    let norm = DVectorView::from_slice(v, v.len()).norm().max(1e-10);
    v.iter().map(|x| x / norm).collect()
}

// ── Detections ───────────────────────────────────────────────────────────────

/// One detected person in one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    /// Position of the frame within its video.  Filled in from the frame
    /// grouping on ingestion.
    #[serde(default)]
    pub frame_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Embedding>,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, frame_index: u32) -> Self {
        Self {
            bbox,
            confidence,
            frame_index,
            face: None,
            body: None,
        }
    }

    pub fn with_face(mut self, face: Embedding) -> Self {
        self.face = Some(face);
        self
    }

    pub fn with_body(mut self, body: Embedding) -> Self {
        self.body = Some(body);
        self
    }

    pub fn evidence(&self) -> Evidence<'_> {
        match (&self.face, &self.body) {
            (Some(face), body) => Evidence::Face {
                face,
                body: body.as_ref(),
            },
            (None, Some(body)) => Evidence::BodyOnly { body },
            (None, None) => Evidence::Absent,
        }
    }
}

/// What a detection can offer the identity cascade.  A failed extractor
/// simply leaves the corresponding modality out.
#[derive(Debug, Clone, Copy)]
pub enum Evidence<'a> {
    Face {
        face: &'a Embedding,
        body: Option<&'a Embedding>,
    },
    BodyOnly {
        body: &'a Embedding,
    },
    Absent,
}

impl<'a> Evidence<'a> {
    pub fn body(&self) -> Option<&'a Embedding> {
        match *self {
            Evidence::Face { body, .. } => body,
            Evidence::BodyOnly { body } => Some(body),
            Evidence::Absent => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(10.0, 10.0, 110.0, 210.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        // Two 10x10 boxes sharing a 5x10 strip: 50 / 150.
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_box_has_zero_iou() {
        let a = BBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn embedding_is_normalised_and_cosine_matches() {
        let a = Embedding::new(vec![3.0, 4.0]);
        let b = Embedding::new(vec![6.0, 8.0]);
        assert!((a.cosine(&b) - 1.0).abs() < 1e-6);
        let c = Embedding::new(vec![-4.0, 3.0]);
        assert!(a.cosine(&c).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_compare_as_zero() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cosine(&b), 0.0);
    }

    #[test]
    fn zero_vector_has_zero_similarity() {
        let z = Embedding::new(vec![0.0, 0.0]);
        let a = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(z.cosine(&a), 0.0);
    }

    #[test]
    fn evidence_variants_follow_available_modalities() {
        let bbox = BBox::new(0.0, 0.0, 1.0, 1.0);
        let bare = Detection::new(bbox, 0.9, 0);
        assert!(matches!(bare.evidence(), Evidence::Absent));

        let body_only = bare.clone().with_body(Embedding::new(vec![1.0, 0.0]));
        assert!(matches!(body_only.evidence(), Evidence::BodyOnly { .. }));

        let face = bare.with_face(Embedding::new(vec![0.0, 1.0]));
        match face.evidence() {
            Evidence::Face { body, .. } => assert!(body.is_none()),
            other => panic!("unexpected evidence {other:?}"),
        }
    }

    #[test]
    fn bbox_serialises_as_array() {
        let b = BBox::new(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
    }
}
