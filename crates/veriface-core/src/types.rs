use serde::{Deserialize, Serialize};

/// Bounding box for a detected face in aligned color/depth pixel coordinates.
///
/// Stored as corner coordinates `(x1, y1) .. (x2, y2)`. Detectors may emit
/// boxes that spill past the frame edges; consumers clamp before sampling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Five-point facial landmarks in the detector's fixed order:
/// [left_eye, right_eye, nose_tip, left_mouth, right_mouth].
///
/// The order is load-bearing — the liveness tests index positionally
/// (nose tip is `landmarks[2]`).
pub type Landmarks = [(f32, f32); 5];

/// Index of the nose-tip landmark within [`Landmarks`].
pub const LANDMARK_NOSE: usize = 2;

/// Face embedding vector (512-dimensional for the reference ArcFace models).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Uses constant-time computation: always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// One detection outcome produced per processed camera frame during an
/// active collection session.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub bbox: FaceBox,
    pub is_live: bool,
    /// Diagnostic sub-scores from the liveness classifier. Advisory only;
    /// the typed contract is `is_live` plus the variation score inside.
    pub liveness: crate::liveness::LivenessScores,
    /// Estimated age, if the analyzer provides one.
    pub age: Option<u32>,
    /// Gender code as emitted by the analyzer (1 = male, 0 = female).
    pub gender: Option<u8>,
    pub embedding: Option<Embedding>,
}

/// A single face returned by the detection black box.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: FaceBox,
    pub landmarks: Landmarks,
    pub confidence: f32,
    pub embedding: Option<Embedding>,
    pub age: Option<u32>,
    pub gender: Option<u8>,
}

/// Error at the face-analyzer boundary. The concrete backend is opaque, so
/// the payload is its own message.
#[derive(Debug, thiserror::Error)]
#[error("face analyzer error: {0}")]
pub struct AnalyzerError(pub String);

/// Face detection/embedding black box.
///
/// Implementations return bounding boxes, 5-point landmarks and a
/// fixed-length embedding per detected face, largest face first.
pub trait FaceAnalyzer {
    fn detect(&mut self, image: &image::RgbImage) -> Result<Vec<Detection>, AnalyzerError>;

    /// Re-embed a specific face region.
    ///
    /// The default implementation reuses the detector's own embedding from a
    /// fresh `detect` pass — an explicit capability choice for backends that
    /// ship no separate recognizer model, not a runtime identity comparison.
    fn embed(
        &mut self,
        image: &image::RgbImage,
        _bbox: &FaceBox,
    ) -> Result<Embedding, AnalyzerError> {
        let detections = self.detect(image)?;
        detections
            .into_iter()
            .find_map(|d| d.embedding)
            .ok_or_else(|| AnalyzerError("no embedding for detected face".into()))
    }
}

/// Error at the depth-sensor boundary.
#[derive(Debug, thiserror::Error)]
#[error("depth sensor error: {0}")]
pub struct SensorError(pub String);

/// One color frame with its pixel-aligned depth image.
pub struct AlignedFrame {
    pub color: image::RgbImage,
    pub depth: crate::depth::DepthFrame,
}

/// Depth sensor black box. Blocks until the next aligned frame pair is
/// available. The handle is owned by exactly one capture loop.
///
/// Implementations must bound how long `next_frame` can block (returning
/// [`SensorError`] on an internal timeout): the capture loop is joined when
/// a session ends, so a call that never returns delays session teardown
/// past its wall-clock cap.
pub trait DepthSensor {
    fn next_frame(&mut self) -> Result<AlignedFrame, SensorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding {
            values: vec![1.0, 0.0, 0.0],
            model_version: None,
        };
        let b = Embedding {
            values: vec![1.0, 0.0, 0.0],
            model_version: None,
        };
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding {
            values: vec![1.0, 0.0],
            model_version: None,
        };
        let b = Embedding {
            values: vec![0.0, 1.0],
            model_version: None,
        };
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding {
            values: vec![0.0, 0.0],
            model_version: None,
        };
        let b = Embedding {
            values: vec![1.0, 0.0],
            model_version: None,
        };
        assert_eq!(a.similarity(&b), 0.0);
    }
}
