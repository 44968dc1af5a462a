//! SCRFD detection + ArcFace embedding via ONNX Runtime.
//!
//! The production [`FaceExtractor`]. Faces are cropped square around the
//! detected box and resized to the ArcFace input; no landmark alignment.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const DET_INPUT_SIZE: u32 = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;
const DET_NMS_THRESHOLD: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

const REC_INPUT_SIZE: u32 = 112;
const REC_MEAN: f32 = 127.5;
const REC_STD: f32 = 127.5;
/// Margin added around the detected box before cropping for recognition.
const REC_CROP_MARGIN: f32 = 0.1;

pub const DETECTOR_MODEL_FILE: &str = "det_500m.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_mbf.onnx";

/// Scale and padding applied when fitting the frame into the detector input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point in detector input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output slots (score, bbox) for one stride.
type StrideSlots = (usize, usize);

pub struct OnnxFaceExtractor {
    detector: Session,
    recognizer: Session,
    slots: [StrideSlots; 3],
    embedding_dim: usize,
}

impl OnnxFaceExtractor {
    /// Load both models from `model_dir`. Fails fast if either file is missing.
    pub fn load(model_dir: &Path, embedding_dim: usize) -> Result<Self, ExtractError> {
        let detector = open_session(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = open_session(&model_dir.join(RECOGNIZER_MODEL_FILE))?;

        let names: Vec<String> = detector.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(ExtractError::InferenceFailed(format!(
                "detector needs score+bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let slots = stride_slots(&names);
        tracing::debug!(?slots, "detector output mapping");

        Ok(Self {
            detector,
            recognizer,
            slots,
            embedding_dim,
        })
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(width, height, DET_INPUT_SIZE);
        let input = detector_input(image, &letterbox);
        let slots = self.slots;

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut boxes = Vec::new();
        for (pos, &stride) in DET_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = slots[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            boxes.extend(decode_stride(scores, deltas, stride, &letterbox));
        }

        Ok(nms(boxes, DET_NMS_THRESHOLD))
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, ExtractError> {
        let input = recognizer_input(image, face);
        let outputs = self
            .recognizer
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != self.embedding_dim {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.embedding_dim,
                raw.len()
            )));
        }

        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|v| v / norm).collect()
        } else {
            raw.to_vec()
        };
        Ok(Embedding::new(values))
    }
}

impl FaceExtractor for OnnxFaceExtractor {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let boxes = self.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.embed(image, &bbox)?;
            faces.push(DetectedFace { bbox, embedding });
        }
        Ok(faces)
    }
}

fn open_session(path: &Path) -> Result<Session, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::ModelNotFound(path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;
    tracing::info!(
        path = %path.display(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Map stride outputs by name (`score_8`, `bbox_8`, ...) or fall back to the
/// standard export order: scores for strides 8/16/32, then boxes.
fn stride_slots(names: &[String]) -> [StrideSlots; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0); 3];
    for (pos, &stride) in DET_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[pos] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

/// Letterboxed NCHW tensor; padding uses the mean so it normalizes to 0.
fn detector_input(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let size = DET_INPUT_SIZE as usize;
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, DET_INPUT_SIZE);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, DET_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + ox, y as usize + oy);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px[c] as f32 - DET_MEAN) / DET_STD;
        }
    }
    tensor
}

/// Square crop around the face, resized to the recognizer input.
fn recognizer_input(image: &RgbImage, face: &BoundingBox) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let side = face.width().max(face.height()) * (1.0 + 2.0 * REC_CROP_MARGIN);
    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;

    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x0 = x0.min(w.saturating_sub(1));
    let y0 = y0.min(h.saturating_sub(1));
    let cw = (side as u32).clamp(1, w - x0);
    let ch = (side as u32).clamp(1, h - y0);

    let crop = imageops::crop_imm(image, x0, y0, cw, ch).to_image();
    let resized = imageops::resize(&crop, REC_INPUT_SIZE, REC_INPUT_SIZE, FilterType::Triangle);
    rgb_to_tensor(&resized, REC_MEAN, REC_STD)
}

fn rgb_to_tensor(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Decode distance-to-edge box predictions for one stride into source coordinates.
fn decode_stride(scores: &[f32], deltas: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid = DET_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * DET_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > DET_SCORE_THRESHOLD)
        .filter_map(|i| {
            let d = deltas.get(i * 4..i * 4 + 4)?;
            let cell = i / DET_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;
            let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
            let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);
            Some(BoundingBox { x1, y1, x2, y2, confidence: scores[i] })
        })
        .collect()
}

/// Greedy non-maximum suppression; output sorted by confidence, best first.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlap() {
        let boxes = vec![
            bbox(0.0, 0.0, 100.0, 100.0, 0.7),
            bbox(5.0, 5.0, 105.0, 105.0, 0.9),
            bbox(300.0, 300.0, 350.0, 350.0, 0.8),
        ];
        let kept = nms(boxes, DET_NMS_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn test_letterbox_unmap() {
        // 1280x720 fits 640 wide at scale 0.5, padded vertically by 140.
        let lb = Letterbox::fit(1280, 720, DET_INPUT_SIZE);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        let (x, y) = lb.unmap(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-3);
        assert!((y - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_stride_slots_named_and_positional() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(stride_slots(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i| format!("{}", 440 + i)).collect();
        assert_eq!(stride_slots(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = DET_INPUT_SIZE as usize / 32;
        let anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut deltas = vec![0.0; anchors * 4];
        // Anchor 2 sits in cell 1 → center (32, 0).
        scores[2] = 0.95;
        deltas[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let boxes = decode_stride(&scores, &deltas, 32, &lb);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0], bbox(16.0, 0.0, 48.0, 32.0, 0.95));
    }

    #[test]
    fn test_recognizer_input_shape_and_normalization() {
        let img = RgbImage::from_pixel(200, 100, Rgb([255, 0, 128]));
        let face = bbox(50.0, 20.0, 110.0, 80.0, 0.9);
        let tensor = recognizer_input(&img, &face);
        assert_eq!(tensor.shape(), &[1, 3, REC_INPUT_SIZE as usize, REC_INPUT_SIZE as usize]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_detector_input_pads_with_zero() {
        let img = RgbImage::from_pixel(64, 32, Rgb([255, 255, 255]));
        let lb = Letterbox::fit(64, 32, DET_INPUT_SIZE);
        let tensor = detector_input(&img, &lb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let mid = (DET_INPUT_SIZE / 2) as usize;
        assert!(tensor[[0, 0, mid, mid]] > 0.9);
    }
}
