//! Appearance descriptors and re-identification.
//!
//! Two extraction strategies share one comparison contract:
//!
//! * learned: a frozen CNN feature extractor run through ONNX Runtime,
//!   globally average-pooled and L2-normalised;
//! * histogram: an 8×8×8 HSV colour histogram, L2-normalised.
//!
//! The strategy is picked once when the matcher is built (capability probe)
//! and never changes for the session. Descriptors remember which strategy
//! produced them and are never compared across strategies.

pub mod histogram;
#[cfg(feature = "onnx")]
pub mod onnx;

use anyhow::Result;
use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::detection::{BoundingBox, DetectionRecord, TrackId};
use crate::video::RgbFrame;

pub use histogram::HistogramExtractor;

/// Score reported for any comparison involving a missing descriptor.
pub const WORST_SIMILARITY: f32 = -1.0;
/// Crops narrower or shorter than this (after clamping) have no descriptor.
pub const MIN_CROP_EXTENT: i32 = 2;

/// Which extraction strategy a matcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherMode {
    Learned,
    Histogram,
}

impl fmt::Display for MatcherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatcherMode::Learned => "learned",
            MatcherMode::Histogram => "histogram",
        })
    }
}

/// Unit-length feature vector tagged with the mode that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppearanceDescriptor {
    mode: MatcherMode,
    values: Vec<f32>,
}

impl AppearanceDescriptor {
    /// L2-normalises `values`. Returns `None` for empty or all-zero input.
    pub fn new(mode: MatcherMode, values: Vec<f32>) -> Option<Self> {
        let values = l2_normalize(values)?;
        Some(Self { mode, values })
    }

    pub fn mode(&self) -> MatcherMode {
        self.mode
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Dot product of two unit descriptors (cosine similarity for learned
/// descriptors). A missing descriptor, mixed modes or mismatched lengths
/// score [`WORST_SIMILARITY`].
pub fn similarity(a: Option<&AppearanceDescriptor>, b: Option<&AppearanceDescriptor>) -> f32 {
    let (Some(a), Some(b)) = (a, b) else {
        return WORST_SIMILARITY;
    };
    if a.mode != b.mode || a.values.len() != b.values.len() {
        return WORST_SIMILARITY;
    }
    let dot: f32 = a.values.iter().zip(&b.values).map(|(x, y)| x * y).sum();
    if dot.is_finite() {
        dot
    } else {
        WORST_SIMILARITY
    }
}

/// Strategy interface: turn an RGB crop into a raw feature vector.
pub trait DescriptorExtractor: Send + Sync {
    fn mode(&self) -> MatcherMode;
    fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>>;
}

/// Outcome of an appearance search over a candidate set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub bbox: Option<BoundingBox>,
    pub track_id: Option<TrackId>,
    pub score: f32,
}

impl MatchResult {
    /// Nothing produced a usable descriptor.
    pub fn none() -> Self {
        Self {
            bbox: None,
            track_id: None,
            score: WORST_SIMILARITY,
        }
    }

    /// The matched box when the score clears `threshold`.
    pub fn accepted(&self, threshold: f32) -> Option<BoundingBox> {
        self.bbox.filter(|_| self.score >= threshold)
    }
}

pub struct AppearanceMatcher {
    extractor: Box<dyn DescriptorExtractor>,
}

impl AppearanceMatcher {
    pub fn new(extractor: Box<dyn DescriptorExtractor>) -> Self {
        Self { extractor }
    }

    pub fn histogram() -> Self {
        Self::new(Box::new(HistogramExtractor))
    }

    /// Pick the extraction strategy: learned descriptors when `model_path`
    /// loads and runs, histogram otherwise. Decided once, never retried.
    pub fn probe(model_path: Option<&Path>) -> Self {
        match model_path {
            #[cfg(feature = "onnx")]
            Some(path) => match onnx::OnnxExtractor::load(path) {
                Ok(extractor) => {
                    info!(model = %path.display(), "appearance matcher using learned descriptors");
                    return Self::new(Box::new(extractor));
                }
                Err(e) => warn!(
                    model = %path.display(),
                    "learned descriptor backend unavailable, falling back to histogram: {e:#}"
                ),
            },
            #[cfg(not(feature = "onnx"))]
            Some(path) => warn!(
                model = %path.display(),
                "built without the onnx feature; falling back to histogram descriptors"
            ),
            None => debug!("no embedding model configured"),
        }
        info!("appearance matcher using histogram descriptors");
        Self::histogram()
    }

    pub fn mode(&self) -> MatcherMode {
        self.extractor.mode()
    }

    /// Descriptor for the region `bbox` of `frame`, or `None` for degenerate
    /// crops and extractor faults.
    pub fn describe(&self, frame: &RgbFrame, bbox: BoundingBox) -> Option<AppearanceDescriptor> {
        let crop = crop_region(frame, bbox)?;
        self.describe_image(&crop)
    }

    /// Descriptor for a whole image, e.g. a reference photo of the subject.
    pub fn describe_image(&self, img: &RgbImage) -> Option<AppearanceDescriptor> {
        if (img.width() as i32) < MIN_CROP_EXTENT || (img.height() as i32) < MIN_CROP_EXTENT {
            return None;
        }
        match self.extractor.extract(img) {
            Ok(values) => AppearanceDescriptor::new(self.extractor.mode(), values),
            Err(e) => {
                warn!("descriptor extraction failed: {e:#}");
                None
            }
        }
    }

    /// Compare every candidate against `target` and return the single best
    /// one. First candidate wins ties.
    pub fn best_match(
        &self,
        frame: &RgbFrame,
        candidates: &[DetectionRecord],
        target: Option<&AppearanceDescriptor>,
    ) -> MatchResult {
        if target.is_none() || candidates.is_empty() {
            return MatchResult::none();
        }

        let scores: Vec<f32> = candidates
            .par_iter()
            .map(|c| {
                let descriptor = self.describe(frame, c.bbox);
                similarity(descriptor.as_ref(), target)
            })
            .collect();

        let mut best = MatchResult::none();
        for (candidate, &score) in candidates.iter().zip(&scores) {
            debug!(track_id = ?candidate.track_id, score, "appearance candidate");
            if score > best.score {
                best = MatchResult {
                    bbox: Some(candidate.bbox),
                    track_id: candidate.track_id,
                    score,
                };
            }
        }
        best
    }
}

/// Copy the clamped `bbox` region out of `frame`. `None` when the clamped
/// region is narrower or shorter than [`MIN_CROP_EXTENT`].
pub fn crop_region(frame: &RgbFrame, bbox: BoundingBox) -> Option<RgbImage> {
    let b = bbox.clamp_to(frame.width, frame.height)?;
    if b.width() < MIN_CROP_EXTENT || b.height() < MIN_CROP_EXTENT {
        return None;
    }
    let (x1, y1) = (b.x1 as usize, b.y1 as usize);
    let (cw, ch) = (b.width() as usize, b.height() as usize);
    let src_stride = frame.width as usize * 3;
    let dst_stride = cw * 3;

    let mut buf = vec![0u8; dst_stride * ch];
    for (row, dst) in buf.chunks_exact_mut(dst_stride).enumerate() {
        let start = (y1 + row) * src_stride + x1 * 3;
        dst.copy_from_slice(frame.data.get(start..start + dst_stride)?);
    }
    RgbImage::from_raw(cw as u32, ch as u32, buf)
}

fn l2_normalize(mut v: Vec<f32>) -> Option<Vec<f32>> {
    if v.is_empty() || v.iter().any(|x| !x.is_finite()) {
        return None;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= 1e-10 {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(v)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    /// Extractor that reports the mean colour of the crop; lets tests build
    /// frames whose regions have chosen similarities.
    pub(crate) struct MeanColor;

    impl DescriptorExtractor for MeanColor {
        fn mode(&self) -> MatcherMode {
            MatcherMode::Learned
        }

        fn extract(&self, crop: &RgbImage) -> Result<Vec<f32>> {
            let n = (crop.width() * crop.height()) as f32;
            let mut sum = [0f32; 3];
            for p in crop.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            Ok(sum.iter().map(|s| s / n).collect())
        }
    }

    fn frame_with_blocks(blocks: &[(BoundingBox, [u8; 3])]) -> RgbFrame {
        let mut img = RgbImage::from_pixel(100, 60, Rgb([0, 0, 0]));
        for (b, color) in blocks {
            for y in b.y1..b.y2 {
                for x in b.x1..b.x2 {
                    img.put_pixel(x as u32, y as u32, Rgb(*color));
                }
            }
        }
        RgbFrame::from_image(img, 0)
    }

    fn desc(values: &[f32]) -> AppearanceDescriptor {
        AppearanceDescriptor::new(MatcherMode::Learned, values.to_vec()).unwrap()
    }

    #[test]
    fn null_descriptor_always_scores_worst() {
        let d = desc(&[1.0, 0.0]);
        assert_eq!(similarity(None, Some(&d)), WORST_SIMILARITY);
        assert_eq!(similarity(Some(&d), None), WORST_SIMILARITY);
        assert_eq!(similarity(None, None), WORST_SIMILARITY);
        for threshold in [0.0f32, 0.2, 0.55, 1.0] {
            assert!(similarity(None, Some(&d)) < threshold);
        }
    }

    #[test]
    fn descriptors_of_different_modes_never_compare() {
        let learned = desc(&[1.0, 0.0]);
        let hist = AppearanceDescriptor::new(MatcherMode::Histogram, vec![1.0, 0.0]).unwrap();
        assert_eq!(similarity(Some(&learned), Some(&hist)), WORST_SIMILARITY);
    }

    #[test]
    fn identical_descriptors_score_one() {
        let d = desc(&[3.0, 4.0]);
        assert!((similarity(Some(&d), Some(&d)) - 1.0).abs() < 1e-6);
        assert_eq!(d.values(), &[0.6, 0.8]);
    }

    #[test]
    fn zero_vector_is_not_a_descriptor() {
        assert!(AppearanceDescriptor::new(MatcherMode::Histogram, vec![0.0; 4]).is_none());
        assert!(AppearanceDescriptor::new(MatcherMode::Histogram, Vec::new()).is_none());
    }

    #[test]
    fn degenerate_crops_have_no_descriptor() {
        let frame = frame_with_blocks(&[]);
        let matcher = AppearanceMatcher::new(Box::new(MeanColor));
        assert!(matcher.describe(&frame, BoundingBox::new(10, 10, 11, 40)).is_none());
        assert!(matcher.describe(&frame, BoundingBox::new(99, 10, 140, 40)).is_none());
        assert!(matcher.describe(&frame, BoundingBox::new(200, 200, 240, 240)).is_none());
    }

    #[test]
    fn best_match_picks_most_similar_candidate() {
        let red = BoundingBox::new(0, 0, 20, 20);
        let blue = BoundingBox::new(30, 0, 50, 20);
        let reddish = BoundingBox::new(60, 0, 80, 20);
        let frame = frame_with_blocks(&[
            (red, [250, 10, 10]),
            (blue, [10, 10, 250]),
            (reddish, [200, 60, 30]),
        ]);
        let matcher = AppearanceMatcher::new(Box::new(MeanColor));
        let target = matcher.describe(&frame, red).unwrap();

        let candidates = vec![
            DetectionRecord::new(blue, Some(TrackId(2)), Some(0.9)),
            DetectionRecord::new(reddish, Some(TrackId(3)), Some(0.8)),
        ];
        let m = matcher.best_match(&frame, &candidates, Some(&target));
        assert_eq!(m.bbox, Some(reddish));
        assert_eq!(m.track_id, Some(TrackId(3)));
        assert!(m.score > 0.9 && m.score < 1.0);
    }

    #[test]
    fn best_match_without_usable_descriptor_reports_sentinel() {
        let frame = frame_with_blocks(&[]);
        let matcher = AppearanceMatcher::new(Box::new(MeanColor));
        let target = desc(&[1.0, 1.0, 1.0]);
        let candidates = vec![DetectionRecord::new(
            BoundingBox::new(5, 5, 6, 6),
            Some(TrackId(1)),
            None,
        )];
        let m = matcher.best_match(&frame, &candidates, Some(&target));
        assert_eq!(m, MatchResult::none());
        assert_eq!(m.accepted(0.0), None);
    }

    #[test]
    fn probe_without_model_selects_histogram() {
        assert_eq!(AppearanceMatcher::probe(None).mode(), MatcherMode::Histogram);
        let missing = Path::new("/nonexistent/appearance.onnx");
        assert_eq!(
            AppearanceMatcher::probe(Some(missing)).mode(),
            MatcherMode::Histogram
        );
    }
}
