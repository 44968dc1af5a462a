//! rollcall-core: gallery matching and face extraction.
//!
//! Matches ArcFace embeddings against an enrolled gallery by cosine
//! similarity. Extraction sits behind [`FaceExtractor`]; the shipped
//! implementation runs SCRFD + ArcFace through ONNX Runtime.

pub mod extractor;
pub mod onnx;
pub mod types;

pub use extractor::{decode_image, save_face_crop, ExtractError, FaceExtractor};
pub use onnx::OnnxFaceExtractor;
pub use types::{BoundingBox, CosineMatcher, DetectedFace, Embedding, GalleryEntry, MatchResult, Matcher};

pub use image::RgbImage;
