//! Deterministic face engine for development and tests.
//!
//! Embeddings come from a 16x8 luminance grid, L2-normalized, so identical
//! images always land at distance zero. Eye openness is read off mean frame
//! luminance (bright frames are open eyes, dark frames closed), which lets
//! the liveness pipeline run end-to-end without a model. A completely
//! uniform frame reports no face.

use super::{Embedding, EmbeddingExtractor, ExtractOutcome, EyeLandmarks, EyePair, LandmarkDetector};
use image::imageops::FilterType;

const GRID_WIDTH: u32 = 16;
const GRID_HEIGHT: u32 = 8;

pub struct DevFaceEngine;

impl DevFaceEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DevFaceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingExtractor for DevFaceEngine {
    fn extract(&self, image: &[u8]) -> ExtractOutcome {
        let decoded = match image::load_from_memory(image) {
            Ok(img) => img,
            Err(e) => return ExtractOutcome::DecodeError(e.to_string()),
        };
        let gray = decoded.to_luma8();
        if is_uniform(gray.as_raw()) {
            return ExtractOutcome::NoFace;
        }

        let cells = image::imageops::resize(&gray, GRID_WIDTH, GRID_HEIGHT, FilterType::Triangle);
        let mut embedding: Embedding = cells
            .as_raw()
            .iter()
            .map(|&p| f32::from(p) / 255.0)
            .collect();
        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in embedding.iter_mut() {
                *value /= norm;
            }
        }
        ExtractOutcome::Embedding(embedding)
    }

    fn dimension(&self) -> usize {
        (GRID_WIDTH * GRID_HEIGHT) as usize
    }
}

impl LandmarkDetector for DevFaceEngine {
    fn eye_landmarks(&self, image: &[u8]) -> Option<EyePair> {
        let decoded = image::load_from_memory(image).ok()?;
        let gray = decoded.to_luma8();
        let raw = gray.as_raw();
        if raw.is_empty() || is_uniform(raw) {
            return None;
        }
        let mean = raw.iter().map(|&p| u64::from(p)).sum::<u64>() as f32 / raw.len() as f32;
        let openness = (mean / 255.0) * 0.5;
        let eye = synthetic_eye(openness);
        Some(EyePair { left: eye, right: eye })
    }
}

fn is_uniform(pixels: &[u8]) -> bool {
    match pixels.first() {
        Some(&first) => pixels.iter().all(|&p| p == first),
        None => true,
    }
}

/// Eye landmarks whose aspect ratio equals `openness` exactly: corners 4
/// apart, upper/lower points 4*openness apart vertically.
fn synthetic_eye(openness: f32) -> EyeLandmarks {
    let h = 2.0 * openness;
    EyeLandmarks {
        points: [
            (0.0, 0.0),
            (1.0, -h),
            (3.0, -h),
            (4.0, 0.0),
            (3.0, h),
            (1.0, h),
        ],
    }
}
