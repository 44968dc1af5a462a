use serde::{Deserialize, Serialize};

/// Guards the cosine denominator against all-zero vectors.
pub const SIMILARITY_EPSILON: f32 = 1e-8;

/// Axis-aligned face box in source-image pixels, `[x1, y1, x2, y2]` corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Corner coordinates rounded to whole pixels, as reported to callers.
    pub fn corners(&self) -> [i32; 4] {
        [
            self.x1.round() as i32,
            self.y1.round() as i32,
            self.x2.round() as i32,
            self.y2.round() as i32,
        ]
    }
}

/// Face feature vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity, `dot(a, b) / (|a| * |b| + eps)`.
    ///
    /// Returns a value in [-1, 1]. A zero vector on either side scores 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        dot / (norm_a.sqrt() * norm_b.sqrt() + SIMILARITY_EPSILON)
    }

    /// Little-endian `f32` bytes, the on-disk layout of a stored vector.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// One face found in an image: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// One enrolled vector in the gallery, tagged with its owner.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub person_id: String,
    pub display_name: String,
    pub embedding: Embedding,
}

/// Outcome of matching a query vector against the gallery.
///
/// The best candidate is reported even when it does not clear the threshold,
/// so review tooling can show who the face was closest to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub recognized: bool,
    pub person_id: Option<String>,
    pub display_name: Option<String>,
    /// Cosine similarity of the best candidate; 0.0 for an empty gallery.
    pub score: f32,
}

impl MatchResult {
    pub fn no_candidates() -> Self {
        Self {
            recognized: false,
            person_id: None,
            display_name: None,
            score: 0.0,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher over the full gallery.
///
/// Every entry is scored; the first entry reaching the strict maximum wins.
/// Entries whose dimension differs from the query are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_score = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                tracing::warn!(
                    person_id = %entry.person_id,
                    expected = query.dim(),
                    actual = entry.embedding.dim(),
                    "skipping gallery vector with mismatched dimension"
                );
                continue;
            }
            let score = query.similarity(&entry.embedding);
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) => MatchResult {
                recognized: best_score >= threshold,
                person_id: Some(gallery[idx].person_id.clone()),
                display_name: Some(gallery[idx].display_name.clone()),
                score: best_score,
            },
            None => MatchResult::no_candidates(),
        }
    }
}
