//! Face extraction seam, image decoding, and face thumbnails.

use crate::types::{BoundingBox, DetectedFace};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image payload is empty")]
    EmptyImage,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl ExtractError {
    /// True when the input bytes were at fault rather than the engine.
    pub fn is_bad_input(&self) -> bool {
        matches!(self, Self::EmptyImage | Self::Decode(_))
    }
}

/// Detects faces in a decoded image and computes one embedding per face.
///
/// Implementations hold model state and are driven from a single thread,
/// hence `&mut self`. An empty result means no face was found.
pub trait FaceExtractor {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError>;
}

/// Decode an encoded image (JPEG, PNG, ...) into 8-bit RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::EmptyImage);
    }
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Save the region under `bbox`, clamped to the image, to `out_path`.
///
/// Returns `Ok(false)` when the clamped region is empty and nothing was written.
/// The parent directory is created if missing.
pub fn save_face_crop(image: &RgbImage, bbox: &BoundingBox, out_path: &Path) -> Result<bool, ExtractError> {
    let (w, h) = image.dimensions();
    let x1 = (bbox.x1.max(0.0) as u32).min(w);
    let y1 = (bbox.y1.max(0.0) as u32).min(h);
    let x2 = (bbox.x2.max(0.0) as u32).min(w);
    let y2 = (bbox.y2.max(0.0) as u32).min(h);
    if x2 <= x1 || y2 <= y1 {
        return Ok(false);
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(image::ImageError::IoError)?;
    }

    let crop = image::imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image();
    crop.save(out_path)?;
    Ok(true)
}
