use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Side length of a canonical face sample, in pixels.
pub const CANONICAL_SIZE: u32 = 100;

/// Stable internal identifier of an enrolled subject.
pub type SubjectId = i64;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Scale every coordinate by independent horizontal and vertical factors.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
        }
    }

    /// Intersect the box with a `width` × `height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Self> {
        let x0 = self.x.max(0.0);
        let y0 = self.y.max(0.0);
        let x1 = (self.x + self.width).min(width as f32);
        let y1 = (self.y + self.height).min(height as f32);
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some(Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            confidence: self.confidence,
        })
    }

    /// Integer pixel rectangle `(x, y, width, height)` inside a frame, if non-empty.
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let b = self.clamped(width, height)?;
        let x0 = (b.x.round() as u32).min(width);
        let y0 = (b.y.round() as u32).min(height);
        let x1 = ((b.x + b.width).round() as u32).min(width);
        let y1 = ((b.y + b.height).round() as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// A normalized grayscale face crop of exactly `CANONICAL_SIZE` × `CANONICAL_SIZE`.
///
/// Only the normalizer and [`CanonicalFace::from_image`] construct one, so every
/// instance handed to the classifier has the canonical dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFace(pub(crate) GrayImage);

impl CanonicalFace {
    /// Wrap an already-normalized image. Returns `None` on a size mismatch.
    pub fn from_image(image: GrayImage) -> Option<Self> {
        if image.width() == CANONICAL_SIZE && image.height() == CANONICAL_SIZE {
            Some(Self(image))
        } else {
            None
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.0
    }
}

/// One labelled training sample.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub face: CanonicalFace,
    pub subject_id: SubjectId,
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub internal_id: SubjectId,
    pub display_name: String,
    pub external_id: String,
    /// JPEG-encoded representative crop captured at enrollment.
    #[serde(skip)]
    pub profile_sample: Option<Vec<u8>>,
}

/// Subject data submitted for registration; the directory assigns the id.
#[derive(Debug, Clone)]
pub struct NewSubject {
    pub display_name: String,
    pub external_id: String,
    pub profile_sample: Option<Vec<u8>>,
}

/// Classifier output: nearest label and its distance (0 = perfect match).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub subject_id: SubjectId,
    pub distance: f64,
}

/// A face matched to a known subject below the confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub subject_id: SubjectId,
    pub display_name: String,
    pub external_id: String,
    pub distance: f64,
    pub observed_at: DateTime<Utc>,
}

/// An accepted attendance entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub subject_id: SubjectId,
    pub display_name: String,
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&RecognitionEvent> for AttendanceRecord {
    fn from(event: &RecognitionEvent) -> Self {
        Self {
            subject_id: event.subject_id,
            display_name: event.display_name.clone(),
            external_id: event.external_id.clone(),
            timestamp: event.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0 }
    }

    #[test]
    fn test_clamped_inside_is_unchanged() {
        let b = bbox(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.clamped(100, 100), Some(b));
    }

    #[test]
    fn test_clamped_trims_overhang() {
        let b = bbox(-10.0, 90.0, 30.0, 40.0).clamped(100, 100).unwrap();
        assert_eq!((b.x, b.y, b.width, b.height), (0.0, 90.0, 20.0, 10.0));
    }

    #[test]
    fn test_clamped_outside_is_none() {
        assert!(bbox(120.0, 0.0, 10.0, 10.0).clamped(100, 100).is_none());
        assert!(bbox(0.0, 0.0, 0.0, 10.0).clamped(100, 100).is_none());
    }

    #[test]
    fn test_pixel_rect_rounds_to_frame() {
        assert_eq!(bbox(9.6, 0.4, 20.2, 10.0).pixel_rect(100, 100), Some((10, 0, 20, 10)));
        assert_eq!(bbox(0.0, 0.0, 5.0, 5.0).pixel_rect(0, 0), None);
    }

    #[test]
    fn test_canonical_face_rejects_wrong_size() {
        assert!(CanonicalFace::from_image(GrayImage::new(99, 100)).is_none());
        assert!(CanonicalFace::from_image(GrayImage::new(CANONICAL_SIZE, CANONICAL_SIZE)).is_some());
    }
}
