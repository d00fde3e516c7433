//! Depth-based liveness detection — geometric analysis of the face surface.
//!
//! A photograph or screen replay held in front of the sensor is geometrically
//! flat: its depth image is a plane (possibly tilted) with almost no relief.
//! A real face is not — the nose sits 5–15 mm proud of the cheek plane and
//! the whole surface curves away toward the perimeter.
//!
//! Three independent tests run on the meter-converted face region:
//!
//! 1. **Depth variation** — max minus min across the box must exceed the
//!    configured threshold (default 10 mm). Guards against trivially flat
//!    targets and anchors the combination below.
//! 2. **Nose prominence** — the small region around the nose-tip landmark
//!    must be more than 5 mm closer to the camera than the average of the
//!    face-box edge bands.
//! 3. **Surface curvature** — the residual standard deviation of a
//!    least-squares plane fit over the box must exceed 3 mm, so a tilted
//!    sheet (which passes test 1) still reads as flat.
//!
//! Combination: `variation && (nose || curvature)`. The AND keeps sensor
//! noise from producing false positives; the OR tolerates one unreliable
//! landmark-local measurement (off-angle faces) when the other independent
//! signal agrees.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, phone/tablet/monitor replays, flat
//!   cutouts at any tilt angle.
//! - **Does not block:** 3D masks or sculpted busts with real relief.

use crate::depth::{self, DepthFrame, PixelRect, RegionSample};
use crate::types::{FaceBox, Landmarks, LANDMARK_NOSE};

/// Half-size of the square sampled around the nose-tip landmark, in pixels.
const NOSE_REGION_PX: usize = 5;
/// Width of each face-box edge band, in pixels.
const EDGE_BAND_PX: usize = 5;
/// Minimum nose-to-perimeter depth difference for a protruding nose, meters.
const NOSE_PROMINENCE_M: f32 = 0.005;
/// Minimum plane-fit residual standard deviation for a curved surface, meters.
const CURVATURE_RESIDUAL_M: f64 = 0.003;
/// Valid-pixel coverage required before attempting the plane fit.
const CURVATURE_MIN_FRACTION: f32 = 0.7;
/// Minimum number of valid samples for a meaningful plane fit.
const CURVATURE_MIN_POINTS: usize = 10;

/// Default box-wide depth variation threshold, millimeters.
pub const DEFAULT_THRESHOLD_MM: f32 = 10.0;

/// Diagnostic sub-scores from one liveness evaluation.
///
/// The typed contract is `depth_variation_mm` plus the booleans; callers may
/// log or display the rest but should not branch on it. The struct is always
/// fully populated, including on validity-gate early exit, so downstream
/// logging sees a consistent shape.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LivenessScores {
    /// Box-wide depth variation (max − min over valid pixels), millimeters.
    pub depth_variation_mm: f32,
    pub depth_variation_passed: bool,
    pub nose_prominence_passed: bool,
    pub curvature_passed: bool,
    /// Fraction of face-box pixels with a real depth reading.
    pub valid_depth_fraction: f32,
}

/// Outcome of one liveness evaluation. Never persisted; recomputed per frame.
#[derive(Debug, Clone, Copy)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub scores: LivenessScores,
}

impl LivenessVerdict {
    fn not_live(scores: LivenessScores) -> Self {
        Self {
            is_live: false,
            scores,
        }
    }
}

/// Classify one face as live or flat from its depth image.
///
/// `threshold_mm` is the box-wide variation threshold (use
/// [`DEFAULT_THRESHOLD_MM`] unless the deployment tunes it). Deterministic:
/// identical inputs always produce an identical verdict and scores. A
/// degenerate or out-of-frame box yields `is_live = false` — malformed-but-
/// in-range input never panics here; only genuine programmer errors (wrong
/// array shapes) propagate.
pub fn check_liveness(
    frame: &DepthFrame,
    bbox: &FaceBox,
    landmarks: &Landmarks,
    threshold_mm: f32,
) -> LivenessVerdict {
    let mut scores = LivenessScores::default();

    let Some(face_rect) = depth::clamp_box(frame, bbox) else {
        tracing::debug!(?bbox, "liveness: degenerate face box");
        return LivenessVerdict::not_live(scores);
    };

    // Validity gate: at least half the face box must carry depth signal.
    // On failure the validity fraction is the only meaningful score.
    let face_sample = depth::sample_rect(frame, face_rect);
    scores.valid_depth_fraction = face_sample.valid_fraction();
    let RegionSample::Valid(face_stats) = face_sample else {
        tracing::debug!(
            valid_fraction = scores.valid_depth_fraction,
            "liveness: insufficient depth coverage"
        );
        return LivenessVerdict::not_live(scores);
    };

    // Test 1: box-wide depth variation.
    let variation_m = face_stats.max_m - face_stats.min_m;
    scores.depth_variation_mm = variation_m * 1000.0;
    scores.depth_variation_passed = variation_m > threshold_mm / 1000.0;

    // Test 2: nose prominence against the face perimeter.
    scores.nose_prominence_passed = nose_prominence(frame, face_rect, landmarks);

    // Test 3: curvature residual from a fitted plane.
    scores.curvature_passed = if face_stats.valid_fraction >= CURVATURE_MIN_FRACTION {
        curvature(frame, face_rect)
    } else {
        false
    };

    let is_live = scores.depth_variation_passed
        && (scores.nose_prominence_passed || scores.curvature_passed);

    LivenessVerdict { is_live, scores }
}

/// Nose-prominence test: mean depth of a small square around the nose-tip
/// landmark versus the averaged edge bands of the face box. Fails
/// conservatively when the nose region or every band lacks valid data.
fn nose_prominence(frame: &DepthFrame, face: PixelRect, landmarks: &Landmarks) -> bool {
    let (nose_x, nose_y) = landmarks[LANDMARK_NOSE];
    let nose_x = nose_x as isize;
    let nose_y = nose_y as isize;

    let r = NOSE_REGION_PX as isize;
    let nx1 = (nose_x - r).max(0) as usize;
    let ny1 = (nose_y - r).max(0) as usize;
    let nx2 = (nose_x + r).clamp(0, frame.width() as isize - 1) as usize;
    let ny2 = (nose_y + r).clamp(0, frame.height() as isize - 1) as usize;
    if nx1 >= nx2 || ny1 >= ny2 {
        return false;
    }

    let Some(nose_depth) = depth::sample_band(
        frame,
        PixelRect {
            x1: nx1,
            y1: ny1,
            x2: nx2,
            y2: ny2,
        },
    ) else {
        return false;
    };

    // Up to four edge bands; each contributes only if it has valid data.
    let b = EDGE_BAND_PX;
    let bands = [
        // top
        PixelRect {
            x1: face.x1,
            y1: face.y1,
            x2: face.x2,
            y2: (face.y1 + b).min(face.y2),
        },
        // bottom
        PixelRect {
            x1: face.x1,
            y1: face.y2.saturating_sub(b).max(face.y1),
            x2: face.x2,
            y2: face.y2,
        },
        // left
        PixelRect {
            x1: face.x1,
            y1: face.y1,
            x2: (face.x1 + b).min(face.x2),
            y2: face.y2,
        },
        // right
        PixelRect {
            x1: face.x2.saturating_sub(b).max(face.x1),
            y1: face.y1,
            x2: face.x2,
            y2: face.y2,
        },
    ];

    let band_means: Vec<f32> = bands
        .iter()
        .filter_map(|band| depth::sample_band(frame, *band))
        .collect();
    if band_means.is_empty() {
        return false;
    }

    let perimeter_depth = band_means.iter().sum::<f32>() / band_means.len() as f32;
    perimeter_depth - nose_depth > NOSE_PROMINENCE_M
}

/// Curvature test: fit `z = ax + by + c` to all valid points in the box and
/// check the residual standard deviation. A singular system counts as fail,
/// not error.
fn curvature(frame: &DepthFrame, face: PixelRect) -> bool {
    let points = frame.valid_points(face);
    if points.len() <= CURVATURE_MIN_POINTS {
        return false;
    }

    let Some((a, b, c)) = fit_plane(&points) else {
        return false;
    };

    let n = points.len() as f64;
    let residuals: Vec<f64> = points
        .iter()
        .map(|&(x, y, z)| z as f64 - (a * x as f64 + b * y as f64 + c))
        .collect();
    let mean = residuals.iter().sum::<f64>() / n;
    let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;

    variance.sqrt() > CURVATURE_RESIDUAL_M
}

/// Least-squares plane through `(x, y, z)` points via the 3×3 normal
/// equations. Returns `None` when the system is singular (e.g. all points
/// collinear).
fn fit_plane(points: &[(f32, f32, f32)]) -> Option<(f64, f64, f64)> {
    let n = points.len() as f64;
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0, 0.0, 0.0, 0.0);
    let (mut sz, mut sxz, mut syz) = (0.0f64, 0.0, 0.0);

    for &(x, y, z) in points {
        let (x, y, z) = (x as f64, y as f64, z as f64);
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
        sz += z;
        sxz += x * z;
        syz += y * z;
    }

    // | sxx sxy sx |   | a |   | sxz |
    // | sxy syy sy | * | b | = | syz |
    // | sx  sy  n  |   | c |   | sz  |
    let det = sxx * (syy * n - sy * sy) - sxy * (sxy * n - sy * sx) + sx * (sxy * sy - syy * sx);
    if det.abs() < 1e-9 {
        return None;
    }

    let det_a =
        sxz * (syy * n - sy * sy) - sxy * (syz * n - sy * sz) + sx * (syz * sy - syy * sz);
    let det_b =
        sxx * (syz * n - sy * sz) - sxz * (sxy * n - sy * sx) + sx * (sxy * sz - syz * sx);
    let det_c =
        sxx * (syy * sz - syz * sy) - sxy * (sxy * sz - syz * sx) + sxz * (sxy * sy - syy * sx);

    Some((det_a / det, det_b / det, det_c / det))
}
