//! Fixtures shared by the daemon's unit tests.
//!
//! `FakeExtractor` keys its behaviour off the colour of pixel (0, 0): black
//! yields no face, pure red fails inference, anything else yields one face
//! whose embedding is the pixel's RGB values.

use chrono::{DateTime, TimeZone, Utc};
use image::{ImageFormat, Rgb, RgbImage};
use rollcall_core::{BoundingBox, DetectedFace, Embedding, ExtractError, FaceExtractor};
use rollcall_store::{NewPerson, Store};
use std::io::Cursor;

pub const NO_FACE: [u8; 3] = [0, 0, 0];
pub const POISON: [u8; 3] = [255, 0, 0];
pub const TEST_DIM: usize = 3;

pub struct FakeExtractor;

impl FaceExtractor for FakeExtractor {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let pixel = image.get_pixel(0, 0).0;
        if pixel == NO_FACE {
            return Ok(Vec::new());
        }
        if pixel == POISON {
            return Err(ExtractError::InferenceFailed("scripted failure".into()));
        }
        Ok(vec![DetectedFace {
            bbox: BoundingBox {
                x1: 1.0,
                y1: 1.0,
                x2: 6.0,
                y2: 6.0,
                confidence: 0.9,
            },
            embedding: Embedding::new(pixel.iter().map(|&c| c as f32).collect()),
        }])
    }
}

/// An 8x8 PNG filled with `color`.
pub fn png(color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 8, Rgb(color));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// 2024-01-01 at `h:m` UTC.
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
}

pub async fn test_store() -> Store {
    Store::open_in_memory().await.unwrap()
}

pub async fn seed_person(store: &Store, id: &str, name: &str) {
    let inserted = store
        .insert_person(
            NewPerson {
                person_id: id.into(),
                name: name.into(),
                department: "CSE".into(),
                term: 3,
                course: "BTech".into(),
            },
            at(8, 0),
        )
        .await
        .unwrap();
    assert!(inserted);
}
