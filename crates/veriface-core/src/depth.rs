//! Depth frame sampling — region statistics with the zero-means-missing rule.
//!
//! Depth sensors emit unsigned 16-bit values in device-native units with a
//! per-stream scale factor to meters. A raw value of 0 means "no reading"
//! (occlusion, IR absorption, out of range) and must never be treated as a
//! real distance. Every sampling function here converts to meters, discards
//! zeros, and reports how much of the region actually carried signal.

use ndarray::Array2;

use crate::types::FaceBox;

/// Minimum fraction of valid (non-zero) pixels for a region to count as
/// carrying enough depth signal.
pub const MIN_VALID_FRACTION: f32 = 0.5;

/// A per-pixel depth image with its meters-per-unit scale.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    data: Array2<u16>,
    scale: f32,
}

impl DepthFrame {
    /// Wrap a raw depth image. `data` is indexed `[row, col]`; `scale`
    /// converts raw units to meters.
    pub fn new(data: Array2<u16>, scale: f32) -> Self {
        Self { data, scale }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Depth at a pixel in meters, or `None` for a missing reading.
    pub fn depth_at(&self, x: usize, y: usize) -> Option<f32> {
        let raw = *self.data.get((y, x))?;
        if raw == 0 {
            None
        } else {
            Some(raw as f32 * self.scale)
        }
    }

    /// All valid readings inside a pixel rect as `(x, y, meters)` triples.
    pub fn valid_points(&self, rect: PixelRect) -> Vec<(f32, f32, f32)> {
        let mut points = Vec::new();
        for y in rect.y1..rect.y2 {
            for x in rect.x1..rect.x2 {
                if let Some(z) = self.depth_at(x, y) {
                    points.push((x as f32, y as f32, z));
                }
            }
        }
        points
    }
}

/// A box clamped to frame bounds, half-open in both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl PixelRect {
    pub fn area(&self) -> usize {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }
}

/// Clamp a float face box to frame bounds.
///
/// Returns `None` if the clamped box is degenerate (zero width or height),
/// which callers treat as "invalid input, not an error".
pub fn clamp_box(frame: &DepthFrame, bbox: &FaceBox) -> Option<PixelRect> {
    let x1 = (bbox.x1.max(0.0)) as usize;
    let y1 = (bbox.y1.max(0.0)) as usize;
    let x2 = (bbox.x2 as isize).clamp(0, frame.width() as isize - 1) as usize;
    let y2 = (bbox.y2 as isize).clamp(0, frame.height() as isize - 1) as usize;

    if x1 >= x2 || y1 >= y2 {
        return None;
    }
    Some(PixelRect { x1, y1, x2, y2 })
}

/// Summary statistics over the valid pixels of a region, in meters.
#[derive(Debug, Clone, Copy)]
pub struct RegionStats {
    pub mean_m: f32,
    pub min_m: f32,
    pub max_m: f32,
    /// Fraction of region pixels with a real reading, in [0, 1].
    pub valid_fraction: f32,
    pub valid_count: usize,
}

/// Outcome of sampling a region.
#[derive(Debug, Clone, Copy)]
pub enum RegionSample {
    Valid(RegionStats),
    /// Degenerate box or not enough signal. Carries the observed valid
    /// fraction (0 for a degenerate box) for diagnostics.
    Invalid { valid_fraction: f32 },
}

impl RegionSample {
    pub fn is_valid(&self) -> bool {
        matches!(self, RegionSample::Valid(_))
    }

    pub fn valid_fraction(&self) -> f32 {
        match self {
            RegionSample::Valid(stats) => stats.valid_fraction,
            RegionSample::Invalid { valid_fraction } => *valid_fraction,
        }
    }
}

/// Sample a rectangular region of the depth frame.
///
/// Clamps the box to frame bounds; a degenerate clamped box is invalid, never
/// a panic. Regions where fewer than [`MIN_VALID_FRACTION`] of pixels carry a
/// reading are invalid regardless of what their mean would be.
/// Deterministic, no side effects.
pub fn sample_region(frame: &DepthFrame, bbox: &FaceBox) -> RegionSample {
    let Some(rect) = clamp_box(frame, bbox) else {
        return RegionSample::Invalid {
            valid_fraction: 0.0,
        };
    };
    sample_rect(frame, rect)
}

/// Sample an already-clamped pixel rect. Same validity rule as
/// [`sample_region`].
pub fn sample_rect(frame: &DepthFrame, rect: PixelRect) -> RegionSample {
    let total = rect.area();
    if total == 0 {
        return RegionSample::Invalid {
            valid_fraction: 0.0,
        };
    }

    let mut sum = 0.0f64;
    let mut min_m = f32::INFINITY;
    let mut max_m = f32::NEG_INFINITY;
    let mut valid_count = 0usize;

    for y in rect.y1..rect.y2 {
        for x in rect.x1..rect.x2 {
            if let Some(z) = frame.depth_at(x, y) {
                sum += z as f64;
                min_m = min_m.min(z);
                max_m = max_m.max(z);
                valid_count += 1;
            }
        }
    }

    let valid_fraction = valid_count as f32 / total as f32;
    if valid_fraction < MIN_VALID_FRACTION {
        return RegionSample::Invalid { valid_fraction };
    }

    RegionSample::Valid(RegionStats {
        mean_m: (sum / valid_count as f64) as f32,
        min_m,
        max_m,
        valid_fraction,
        valid_count,
    })
}

/// Mean depth of a thin band (e.g. a 5 px edge strip of a face box).
///
/// Unlike [`sample_region`] there is no fraction gate: a band contributes as
/// long as it has any valid pixel. Returns `None` for an empty or fully
/// missing band so the caller can skip it.
pub fn sample_band(frame: &DepthFrame, rect: PixelRect) -> Option<f32> {
    if rect.x1 >= rect.x2 || rect.y1 >= rect.y2 {
        return None;
    }

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for y in rect.y1..rect.y2 {
        for x in rect.x1..rect.x2 {
            if let Some(z) = frame.depth_at(x, y) {
                sum += z as f64;
                count += 1;
            }
        }
    }

    if count == 0 {
        None
    } else {
        Some((sum / count as f64) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn uniform_frame(width: usize, height: usize, raw: u16, scale: f32) -> DepthFrame {
        DepthFrame::new(Array2::from_elem((height, width), raw), scale)
    }

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2 }
    }

    #[test]
    fn test_sample_region_uniform() {
        // 1000 raw units at 1 mm/unit = 1.0 m everywhere
        let frame = uniform_frame(64, 48, 1000, 0.001);
        let RegionSample::Valid(stats) = sample_region(&frame, &bbox(10.0, 10.0, 30.0, 30.0))
        else {
            panic!("expected valid sample");
        };
        assert!((stats.mean_m - 1.0).abs() < 1e-6);
        assert!((stats.min_m - 1.0).abs() < 1e-6);
        assert!((stats.max_m - 1.0).abs() < 1e-6);
        assert_eq!(stats.valid_fraction, 1.0);
        assert_eq!(stats.valid_count, 400);
    }

    #[test]
    fn test_degenerate_box_invalid_not_panic() {
        let frame = uniform_frame(64, 48, 1000, 0.001);
        // x1 >= x2 after clamping
        for b in [
            bbox(30.0, 10.0, 10.0, 30.0),
            bbox(10.0, 30.0, 30.0, 10.0),
            bbox(10.0, 10.0, 10.0, 30.0),
            // entirely outside the frame
            bbox(100.0, 100.0, 200.0, 200.0),
            bbox(-50.0, -50.0, -10.0, -10.0),
        ] {
            let sample = sample_region(&frame, &b);
            assert!(!sample.is_valid(), "box {b:?} should be invalid");
            assert_eq!(sample.valid_fraction(), 0.0);
        }
    }

    #[test]
    fn test_box_clamped_to_frame() {
        let frame = uniform_frame(64, 48, 500, 0.001);
        // Spills past every edge — clamps to the full frame minus the last
        // row/column and still samples fine.
        let sample = sample_region(&frame, &bbox(-10.0, -10.0, 100.0, 100.0));
        assert!(sample.is_valid());
    }

    #[test]
    fn test_zero_pixels_are_missing() {
        let mut data = Array2::from_elem((10, 10), 1000u16);
        // 40% of the box reads zero; mean must ignore them entirely
        for y in 0..4 {
            for x in 0..10 {
                data[(y, x)] = 0;
            }
        }
        let frame = DepthFrame::new(data, 0.001);
        let RegionSample::Valid(stats) = sample_region(&frame, &bbox(0.0, 0.0, 10.0, 10.0))
        else {
            panic!("60% valid should pass the gate");
        };
        // clamped to 9x9 = 81 px, rows 0..4 missing = 36 px missing
        assert_eq!(stats.valid_count, 45);
        assert!((stats.mean_m - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_under_half_valid_is_invalid() {
        let mut data = Array2::from_elem((10, 10), 1000u16);
        for y in 0..6 {
            for x in 0..10 {
                data[(y, x)] = 0;
            }
        }
        let frame = DepthFrame::new(data, 0.001);
        let sample = sample_region(&frame, &bbox(0.0, 0.0, 10.0, 10.0));
        assert!(!sample.is_valid());
        assert!(sample.valid_fraction() < MIN_VALID_FRACTION);
    }

    #[test]
    fn test_all_zero_region_invalid() {
        let frame = uniform_frame(16, 16, 0, 0.001);
        let sample = sample_region(&frame, &bbox(0.0, 0.0, 16.0, 16.0));
        assert!(!sample.is_valid());
        assert_eq!(sample.valid_fraction(), 0.0);
    }

    #[test]
    fn test_band_skips_missing() {
        let mut data = Array2::from_elem((10, 10), 0u16);
        data[(0, 3)] = 2000; // single valid pixel in the band
        let frame = DepthFrame::new(data, 0.001);

        let band = PixelRect {
            x1: 0,
            y1: 0,
            x2: 10,
            y2: 2,
        };
        let mean = sample_band(&frame, band).expect("one valid pixel is enough for a band");
        assert!((mean - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_band_empty_or_all_missing_is_none() {
        let frame = uniform_frame(10, 10, 0, 0.001);
        let band = PixelRect {
            x1: 0,
            y1: 0,
            x2: 10,
            y2: 2,
        };
        assert!(sample_band(&frame, band).is_none());

        let degenerate = PixelRect {
            x1: 5,
            y1: 5,
            x2: 5,
            y2: 8,
        };
        assert!(sample_band(&frame, degenerate).is_none());
    }

    #[test]
    fn test_deterministic() {
        let mut data = Array2::from_elem((20, 20), 800u16);
        data[(5, 5)] = 0;
        data[(7, 9)] = 1200;
        let frame = DepthFrame::new(data, 0.00025);
        let b = bbox(2.0, 2.0, 18.0, 18.0);

        let first = sample_region(&frame, &b);
        let second = sample_region(&frame, &b);
        match (first, second) {
            (RegionSample::Valid(a), RegionSample::Valid(b)) => {
                assert_eq!(a.mean_m.to_bits(), b.mean_m.to_bits());
                assert_eq!(a.valid_count, b.valid_count);
            }
            _ => panic!("expected valid samples"),
        }
    }
}
