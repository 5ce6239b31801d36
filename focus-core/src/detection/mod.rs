//! detection — detector interface and the detection adapter
//!
//! The detector/tracker itself is an external collaborator: it hands back
//! array-shaped output (a box list plus optional parallel identity and
//! confidence arrays). Everything downstream only ever sees the normalised
//! [`DetectionRecord`] list produced here.

pub mod replay;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use crate::video::RgbFrame;

pub use replay::ReplayDetector;

/// Default size of the candidate set handed to the appearance matcher.
pub const DEFAULT_MAX_CANDIDATES: usize = 5;
/// Detector coordinates are clamped to ±this many pixels.
pub const MAX_COORDINATE: i32 = 1 << 24;

// ── Public types ─────────────────────────────────────────────────────────────

/// Persistent label an external tracker assigns to a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub i64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Axis-aligned box in integer pixel coordinates of the frame it was
/// produced for. Only trusted within that frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x1 as f32 + self.x2 as f32) / 2.0,
            (self.y1 as f32 + self.y2 as f32) / 2.0,
        )
    }

    /// Point-in-box test with inclusive edges.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Euclidean distance between this box's centre and a point.
    pub fn distance_to_point(&self, x: f32, y: f32) -> f32 {
        let (cx, cy) = self.center();
        ((cx - x).powi(2) + (cy - y).powi(2)).sqrt()
    }

    /// Euclidean distance between the two box centres.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (cx, cy) = other.center();
        self.distance_to_point(cx, cy)
    }

    /// Clamp to `[0, width] × [0, height]` (end coordinates exclusive).
    /// Returns `None` when nothing of positive area is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        let clamped = BoundingBox {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        };
        (clamped.width() > 0 && clamped.height() > 0).then_some(clamped)
    }
}

/// One detector output after normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub bbox: BoundingBox,
    pub track_id: Option<TrackId>,
    pub confidence: Option<f32>,
}

impl DetectionRecord {
    pub fn new(bbox: BoundingBox, track_id: Option<TrackId>, confidence: Option<f32>) -> Self {
        Self {
            bbox,
            track_id,
            confidence,
        }
    }
}

/// Raw per-frame detector output: a box list in `[x1, y1, x2, y2]` form plus
/// optional parallel identity and confidence arrays. Entries of the parallel
/// arrays are themselves optional, so one anonymous box does not cost the
/// rest of the frame their identities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetections {
    pub boxes: Vec<[f32; 4]>,
    #[serde(default)]
    pub ids: Option<Vec<Option<i64>>>,
    #[serde(default)]
    pub confidences: Option<Vec<Option<f32>>>,
}

impl RawDetections {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// External detector/tracker. Identity persistence across frames is the
/// implementor's responsibility and is only assumed best-effort.
pub trait Detector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<RawDetections>;
}

// ── Adapter ──────────────────────────────────────────────────────────────────

/// Normalise raw detector output into records, preserving detector order.
///
/// Never fails: non-finite boxes are dropped, coordinates are clamped to
/// [`MAX_COORDINATE`], identity/confidence entries missing from a short
/// parallel array become `None`, and confidences are clamped to `[0, 1]`.
pub fn normalize(raw: &RawDetections) -> Vec<DetectionRecord> {
    let records: Vec<DetectionRecord> = raw
        .boxes
        .iter()
        .enumerate()
        .filter_map(|(i, b)| {
            if b.iter().any(|v| !v.is_finite()) {
                return None;
            }
            let (ax, ay, bx, by) = (coord(b[0]), coord(b[1]), coord(b[2]), coord(b[3]));
            let bbox = BoundingBox::new(ax.min(bx), ay.min(by), ax.max(bx), ay.max(by));
            let track_id = raw
                .ids
                .as_ref()
                .and_then(|ids| ids.get(i).copied().flatten())
                .map(TrackId);
            let confidence = raw
                .confidences
                .as_ref()
                .and_then(|c| c.get(i).copied().flatten())
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0));
            Some(DetectionRecord::new(bbox, track_id, confidence))
        })
        .collect();

    if records.len() != raw.boxes.len() {
        debug!(
            dropped = raw.boxes.len() - records.len(),
            "dropped non-finite detector boxes"
        );
    }
    records
}

/// Truncation toward zero, same as an integer cast of tracker output.
fn coord(v: f32) -> i32 {
    (v as i32).clamp(-MAX_COORDINATE, MAX_COORDINATE)
}

/// Run the detector and normalise; detector faults degrade to "no detections".
pub fn detect_records(detector: &mut dyn Detector, frame: &RgbFrame) -> Vec<DetectionRecord> {
    match detector.detect(frame) {
        Ok(raw) => normalize(&raw),
        Err(e) => {
            tracing::warn!("detection error: {e:#}");
            Vec::new()
        }
    }
}

/// Top-`k` records by confidence, descending. Ties (and records without a
/// confidence, which rank last) keep their original order.
pub fn top_candidates(records: &[DetectionRecord], k: usize) -> Vec<DetectionRecord> {
    let mut ranked: Vec<DetectionRecord> = records.to_vec();
    ranked.sort_by(|a, b| rank(b).partial_cmp(&rank(a)).unwrap_or(Ordering::Equal));
    ranked.truncate(k);
    ranked
}

fn rank(record: &DetectionRecord) -> f32 {
    record.confidence.unwrap_or(f32::NEG_INFINITY)
}

/// First record carrying `track_id`.
pub fn find_by_identity(records: &[DetectionRecord], track_id: TrackId) -> Option<&DetectionRecord> {
    records.iter().find(|r| r.track_id == Some(track_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(x1: i32, conf: Option<f32>, id: i64) -> DetectionRecord {
        DetectionRecord::new(
            BoundingBox::new(x1, 0, x1 + 10, 10),
            Some(TrackId(id)),
            conf,
        )
    }

    #[test]
    fn normalize_handles_missing_arrays() {
        let raw = RawDetections {
            boxes: vec![[1.9, 2.2, 30.7, 40.1], [5.0, 5.0, 6.0, 6.0]],
            ids: None,
            confidences: None,
        };
        let records = normalize(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].bbox, BoundingBox::new(1, 2, 30, 40));
        assert!(records.iter().all(|r| r.track_id.is_none() && r.confidence.is_none()));
    }

    #[test]
    fn normalize_of_empty_output_is_empty() {
        assert!(normalize(&RawDetections::default()).is_empty());
    }

    #[test]
    fn normalize_drops_non_finite_and_tolerates_short_arrays() {
        let raw = RawDetections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0], [f32::NAN, 0.0, 1.0, 1.0], [20.0, 20.0, 5.0, 5.0]],
            ids: Some(vec![Some(3)]),
            confidences: Some(vec![Some(1.4), Some(0.2), Some(f32::NAN)]),
        };
        let records = normalize(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].track_id, Some(TrackId(3)));
        assert_eq!(records[0].confidence, Some(1.0));
        // Swapped corners are re-ordered, missing id and NaN confidence are None.
        assert_eq!(records[1].bbox, BoundingBox::new(5, 5, 20, 20));
        assert_eq!(records[1].track_id, None);
        assert_eq!(records[1].confidence, None);
    }

    #[test]
    fn normalize_keeps_identities_around_anonymous_boxes() {
        let raw = RawDetections {
            boxes: vec![[0.0, 0.0, 10.0, 10.0], [20.0, 0.0, 30.0, 10.0], [40.0, 0.0, 50.0, 10.0]],
            ids: Some(vec![Some(7), None, Some(9)]),
            confidences: Some(vec![None, Some(0.6), Some(0.8)]),
        };
        let records = normalize(&raw);
        let ids: Vec<_> = records.iter().map(|r| r.track_id).collect();
        assert_eq!(ids, vec![Some(TrackId(7)), None, Some(TrackId(9))]);
        let confs: Vec<_> = records.iter().map(|r| r.confidence).collect();
        assert_eq!(confs, vec![None, Some(0.6), Some(0.8)]);
    }

    #[test]
    fn normalize_clamps_huge_coordinates() {
        let raw = RawDetections {
            boxes: vec![[-3e9, 0.0, 3e9, 10.0]],
            ids: Some(vec![Some(7)]),
            confidences: None,
        };
        let records = normalize(&raw);
        assert_eq!(
            records[0].bbox,
            BoundingBox::new(-MAX_COORDINATE, 0, MAX_COORDINATE, 10)
        );
        assert_eq!(records[0].bbox.width(), 2 * MAX_COORDINATE);
    }

    #[test]
    fn extents_saturate_instead_of_overflowing() {
        let b = BoundingBox::new(i32::MIN, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(b.width(), i32::MAX);
        assert_eq!(b.height(), i32::MAX);
    }

    #[test]
    fn top_candidates_sorts_by_confidence_with_stable_ties() {
        let records = vec![
            rec(0, Some(0.5), 1),
            rec(10, Some(0.9), 2),
            rec(20, None, 3),
            rec(30, Some(0.5), 4),
            rec(40, Some(0.7), 5),
        ];
        let top = top_candidates(&records, 4);
        let ids: Vec<i64> = top.iter().map(|r| r.track_id.unwrap().0).collect();
        assert_eq!(ids, vec![2, 5, 1, 4]);
    }

    #[test]
    fn top_candidates_without_confidence_keeps_detector_order() {
        let records: Vec<_> = (0..7).map(|i| rec(i * 10, None, i as i64)).collect();
        let top = top_candidates(&records, DEFAULT_MAX_CANDIDATES);
        let ids: Vec<i64> = top.iter().map(|r| r.track_id.unwrap().0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn clamp_rejects_boxes_outside_frame() {
        let b = BoundingBox::new(-5, -5, 50, 50);
        assert_eq!(b.clamp_to(40, 30), Some(BoundingBox::new(0, 0, 40, 30)));
        assert_eq!(BoundingBox::new(45, 0, 60, 10).clamp_to(40, 30), None);
        assert_eq!(BoundingBox::new(5, 5, 5, 9).clamp_to(40, 30), None);
    }

    #[test]
    fn contains_is_edge_inclusive() {
        let b = BoundingBox::new(10, 10, 50, 50);
        assert!(b.contains(10, 50));
        assert!(!b.contains(9, 20));
    }
}
