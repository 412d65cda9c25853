//! Face detection.
//!
//! [`ScrfdDetector`] runs SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) through ONNX Runtime with 3-stride anchor decoding
//! and NMS. [`ScaledDetector`] wraps any detector to run it on a downscaled
//! copy of the frame and map the boxes back to full-frame coordinates.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

// --- SCRFD constants ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates candidate faces in a color frame.
///
/// Implementations return an empty list for frames without faces and for
/// empty (zero-sized) frames.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError> {
        (**self).detect(frame)
    }
}

/// Order boxes top-to-bottom, then left-to-right.
pub fn sort_scan_order(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| a.y.total_cmp(&b.y).then_with(|| a.x.total_cmp(&b.x)));
}

/// Runs an inner detector on a downscaled frame.
///
/// Every returned box is rescaled to original-frame coordinates and clamped
/// to the frame before it leaves this wrapper; boxes whose shorter side is
/// under `min_face_size` (original pixels) are dropped.
pub struct ScaledDetector<D> {
    inner: D,
    scale: f32,
    min_face_size: f32,
}

impl<D: FaceDetector> ScaledDetector<D> {
    /// `scale` is clamped into `(0, 1]`; `1.0` disables downscaling.
    pub fn new(inner: D, scale: f32, min_face_size: u32) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 { scale.min(1.0) } else { 1.0 };
        Self {
            inner,
            scale,
            min_face_size: min_face_size as f32,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: FaceDetector> FaceDetector for ScaledDetector<D> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError> {
        let (fw, fh) = frame.dimensions();
        if fw == 0 || fh == 0 {
            return Ok(Vec::new());
        }

        let raw = if self.scale < 1.0 {
            let sw = ((fw as f32 * self.scale).round() as u32).max(1);
            let sh = ((fh as f32 * self.scale).round() as u32).max(1);
            let small = imageops::resize(frame, sw, sh, FilterType::Triangle);
            let (sx, sy) = (fw as f32 / sw as f32, fh as f32 / sh as f32);
            self.inner
                .detect(&small)?
                .into_iter()
                .map(|b| b.scaled(sx, sy))
                .collect::<Vec<_>>()
        } else {
            self.inner.detect(frame)?
        };

        let mut boxes: Vec<BoundingBox> = raw
            .into_iter()
            .filter_map(|b| b.clamped(fw, fh))
            .filter(|b| b.width.min(b.height) >= self.min_face_size)
            .collect();
        sort_scan_order(&mut boxes);
        Ok(boxes)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectionError> {
        if !model_path.exists() {
            return Err(DetectionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Score and bbox tensors are required; keypoint tensors may be present
        // but are not used.
        if output_names.len() < 6 {
            return Err(DetectionError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, stride_indices })
    }

    /// Letterbox an RGB frame into a normalized NCHW tensor.
    fn preprocess(frame: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = frame.dimensions();
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0;
        let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0;

        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        // Padding is left at zero, which is SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let x_off = pad_x.floor() as usize;
        let y_off = pad_y.floor() as usize;
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + x_off, y as usize + y_off);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all.extend(decode_stride(scores, bboxes, stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let mut result = nms(all, SCRFD_NMS_THRESHOLD);
        sort_scan_order(&mut result);
        Ok(result)
    }
}

/// Map output tensors to stride slots.
///
/// Named exports ("score_8", "bbox_16", ...) are matched by name; anything
/// else falls back to the standard positional layout where scores occupy
/// [0-2] and boxes [3-5].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| *n == format!("{prefix}_{stride}"));

    let mut named = [(0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[slot] = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Decode detections for one stride level into input-frame coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid) as f32 * s;
        let anchor_y = (cell / grid) as f32 * s;

        let x1 = (anchor_x - bboxes[off] * s - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_y - bboxes[off + 1] * s - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_x + bboxes[off + 2] * s - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_y + bboxes[off + 3] * s - letterbox.pad_y) / letterbox.scale;

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }
    detections
}

/// Non-Maximum Suppression: keep the most confident of overlapping boxes.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
