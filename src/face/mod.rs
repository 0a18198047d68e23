//! Face analysis capability seams.
//!
//! Embedding extraction and eye-landmark detection are opaque to the rest
//! of the pipeline; real engines and the deterministic dev engine plug in
//! behind the same traits.

pub mod dev;

pub use dev::DevFaceEngine;

/// Fixed-dimension face embedding.
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    /// A face was found and embedded.
    Embedding(Embedding),
    /// The image decoded but contained no face.
    NoFace,
    /// The image bytes could not be decoded.
    DecodeError(String),
}

pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> ExtractOutcome;

    /// Dimension of every embedding this extractor produces.
    fn dimension(&self) -> usize;
}

/// Six landmark points for one eye, ordered p0..p5 with p0/p3 the
/// horizontal corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeLandmarks {
    pub points: [(f32, f32); 6],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyePair {
    pub left: EyeLandmarks,
    pub right: EyeLandmarks,
}

pub trait LandmarkDetector: Send + Sync {
    /// Eye landmarks for the most prominent face, or None when no face is
    /// visible in the frame.
    fn eye_landmarks(&self, image: &[u8]) -> Option<EyePair>;
}

/// Squared Euclidean distance between two embeddings.
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
