//! File-backed capture backend.
//!
//! Replays recorded sensor sessions from a directory so the daemon can run
//! without camera hardware: kiosk recordings are dumped as per-frame triples
//! `NNN.png` (color), `NNN.depth` (raw little-endian u16, row-major, color
//! dimensions) and `NNN.json` (detections for that frame). A `meta.json` at
//! the directory root carries the depth scale. Frames replay in filename
//! order and wrap around, so a session longer than the recording keeps
//! producing data.
//!
//! The analyzer side replays the same scripted detection lists in order,
//! independent of the image it is handed. That is sufficient for driving the
//! full daemon path in development; a production build wires real detector
//! hardware behind the same two traits.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use thiserror::Error;
use veriface_core::depth::DepthFrame;
use veriface_core::types::{
    AlignedFrame, AnalyzerError, DepthSensor, Detection, FaceAnalyzer, SensorError,
};
use veriface_core::{Embedding, FaceBox};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("replay directory {0} contains no frames")]
    Empty(PathBuf),
    #[error("depth file {path} is {actual} bytes, expected {expected}")]
    DepthSize {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

#[derive(serde::Deserialize)]
struct ReplayMeta {
    depth_scale: f32,
}

#[derive(serde::Deserialize)]
struct DetectionRecord {
    bbox: [f32; 4],
    landmarks: [[f32; 2]; 5],
    confidence: f32,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    age: Option<u32>,
    #[serde(default)]
    gender: Option<u8>,
}

impl From<DetectionRecord> for Detection {
    fn from(r: DetectionRecord) -> Self {
        Detection {
            bbox: FaceBox {
                x1: r.bbox[0],
                y1: r.bbox[1],
                x2: r.bbox[2],
                y2: r.bbox[3],
            },
            landmarks: [
                (r.landmarks[0][0], r.landmarks[0][1]),
                (r.landmarks[1][0], r.landmarks[1][1]),
                (r.landmarks[2][0], r.landmarks[2][1]),
                (r.landmarks[3][0], r.landmarks[3][1]),
                (r.landmarks[4][0], r.landmarks[4][1]),
            ],
            confidence: r.confidence,
            embedding: r.embedding.map(|values| Embedding {
                values,
                model_version: None,
            }),
            age: r.age,
            gender: r.gender,
        }
    }
}

/// Sorted frame stems (paths without extension) under a replay directory.
fn frame_stems(dir: &Path) -> Result<Vec<PathBuf>, BackendError> {
    let mut stems = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "png") {
            stems.push(path.with_extension(""));
        }
    }
    if stems.is_empty() {
        return Err(BackendError::Empty(dir.to_path_buf()));
    }
    stems.sort();
    Ok(stems)
}

fn load_depth(path: &Path, width: usize, height: usize) -> Result<Array2<u16>, BackendError> {
    let bytes = std::fs::read(path)?;
    let expected = width * height * 2;
    if bytes.len() != expected {
        return Err(BackendError::DepthSize {
            path: path.to_path_buf(),
            expected,
            actual: bytes.len(),
        });
    }
    let raw: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    // Shape is checked above, from_shape_vec cannot fail here
    Ok(Array2::from_shape_vec((height, width), raw)
        .unwrap_or_else(|_| Array2::zeros((height, width))))
}

/// Replays recorded aligned frames in a loop.
pub struct ReplaySensor {
    stems: Vec<PathBuf>,
    depth_scale: f32,
    cursor: usize,
}

impl ReplaySensor {
    pub fn open(dir: &Path) -> Result<Self, BackendError> {
        let meta: ReplayMeta =
            serde_json::from_str(&std::fs::read_to_string(dir.join("meta.json"))?)?;
        let stems = frame_stems(dir)?;
        tracing::info!(
            dir = %dir.display(),
            frames = stems.len(),
            depth_scale = meta.depth_scale,
            "replay sensor opened"
        );
        Ok(Self {
            stems,
            depth_scale: meta.depth_scale,
            cursor: 0,
        })
    }

    fn load_frame(&self, stem: &Path) -> Result<AlignedFrame, BackendError> {
        let color = image::open(stem.with_extension("png"))?.to_rgb8();
        let depth = load_depth(
            &stem.with_extension("depth"),
            color.width() as usize,
            color.height() as usize,
        )?;
        Ok(AlignedFrame {
            color,
            depth: DepthFrame::new(depth, self.depth_scale),
        })
    }
}

impl DepthSensor for ReplaySensor {
    fn next_frame(&mut self) -> Result<AlignedFrame, SensorError> {
        let stem = self.stems[self.cursor % self.stems.len()].clone();
        self.cursor += 1;
        self.load_frame(&stem)
            .map_err(|e| SensorError(e.to_string()))
    }
}

/// Replays the recorded detection lists in order, wrapping around.
pub struct ReplayAnalyzer {
    frames: Vec<Vec<DetectionRecord>>,
    cursor: usize,
}

impl ReplayAnalyzer {
    pub fn open(dir: &Path) -> Result<Self, BackendError> {
        let mut frames = Vec::new();
        for stem in frame_stems(dir)? {
            let json = std::fs::read_to_string(stem.with_extension("json"))?;
            frames.push(serde_json::from_str(&json)?);
        }
        Ok(Self { frames, cursor: 0 })
    }
}

impl FaceAnalyzer for ReplayAnalyzer {
    fn detect(&mut self, _image: &image::RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        let records = &self.frames[self.cursor % self.frames.len()];
        self.cursor += 1;
        Ok(records
            .iter()
            .map(|r| {
                Detection::from(DetectionRecord {
                    bbox: r.bbox,
                    landmarks: r.landmarks,
                    confidence: r.confidence,
                    embedding: r.embedding.clone(),
                    age: r.age,
                    gender: r.gender,
                })
            })
            .collect())
    }
}

/// Build the capture backend named by the configuration. Fails fast when no
/// backend is configured so the daemon never comes up half-ready.
pub fn load_backends(
    replay_dir: Option<&Path>,
) -> anyhow::Result<(Box<dyn DepthSensor + Send>, Box<dyn FaceAnalyzer + Send>)> {
    let Some(dir) = replay_dir else {
        anyhow::bail!(
            "no capture backend configured; set VERIFACE_REPLAY_DIR to a recorded session"
        );
    };
    let sensor = ReplaySensor::open(dir)?;
    let analyzer = ReplayAnalyzer::open(dir)?;
    Ok((Box::new(sensor), Box::new(analyzer)))
}
