//! HSV colour-histogram descriptors (fallback strategy).
//!
//! 8 bins per channel over H ∈ [0, 180), S ∈ [0, 256), V ∈ [0, 256), the
//! 8-bit HSV convention, flattened H-major to 512 values. Normalisation
//! happens in [`AppearanceDescriptor::new`](super::AppearanceDescriptor::new).

use anyhow::Result;
use image::RgbImage;

use super::{DescriptorExtractor, MatcherMode};

pub const BINS_PER_CHANNEL: usize = 8;
pub const HISTOGRAM_LEN: usize = BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL;

const HUE_RANGE: f32 = 180.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramExtractor;

impl DescriptorExtractor for HistogramExtractor {
    fn mode(&self) -> MatcherMode {
        MatcherMode::Histogram
    }

    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
        let mut hist = vec![0f32; HISTOGRAM_LEN];
        for px in crop.pixels() {
            let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
            let hb = ((h / HUE_RANGE * BINS_PER_CHANNEL as f32) as usize).min(BINS_PER_CHANNEL - 1);
            let sb = s as usize * BINS_PER_CHANNEL / 256;
            let vb = v as usize * BINS_PER_CHANNEL / 256;
            hist[(hb * BINS_PER_CHANNEL + sb) * BINS_PER_CHANNEL + vb] += 1.0;
        }
        Ok(hist)
    }
}

/// 8-bit HSV: hue in degrees / 2 (so [0, 180)), saturation and value in
/// [0, 255].
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = (max - min) as f32;
    let v = max;
    let s = if max == 0 {
        0
    } else {
        (255.0 * delta / max as f32).round() as u8
    };
    if delta == 0.0 {
        return (0.0, s, v);
    }
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let mut deg = if max as f32 == r {
        60.0 * (g - b) / delta
    } else if max as f32 == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if deg < 0.0 {
        deg += 360.0;
    }
    ((deg / 2.0).min(HUE_RANGE - f32::EPSILON), s, v)
}
