//! Replays detections recorded by an external tracker.
//!
//! Track file layout (JSON):
//!
//! ```json
//! { "frames": [
//!     { "frame": 0, "detections": [ { "bbox": [10, 10, 50, 80], "id": 7, "confidence": 0.91 } ] }
//! ] }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::info;

use super::{Detector, RawDetections};
use crate::video::RgbFrame;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackFile {
    pub frames: Vec<TrackFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackFrame {
    pub frame: i64,
    #[serde(default)]
    pub detections: Vec<TrackDetection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDetection {
    pub bbox: [f32; 4],
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Detector that serves recorded output keyed by frame `pts`.
/// Frames absent from the file yield no detections.
pub struct ReplayDetector {
    by_frame: HashMap<i64, RawDetections>,
}

impl ReplayDetector {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("could not open track file {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("invalid track file {}", path.display()))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let tracks: TrackFile =
            serde_json::from_reader(reader).context("failed to parse track JSON")?;
        Ok(Self::from_tracks(tracks))
    }

    pub fn from_tracks(tracks: TrackFile) -> Self {
        let by_frame: HashMap<i64, RawDetections> = tracks
            .frames
            .into_iter()
            .map(|f| (f.frame, to_raw(f.detections)))
            .collect();
        info!(frames = by_frame.len(), "loaded replay detections");
        Self { by_frame }
    }

    pub fn frame_count(&self) -> usize {
        self.by_frame.len()
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<RawDetections> {
        Ok(self.by_frame.get(&frame.pts).cloned().unwrap_or_default())
    }
}

/// Per-detection optional fields become parallel arrays, entry by entry. An
/// array is omitted when no detection in the frame carries the field.
fn to_raw(detections: Vec<TrackDetection>) -> RawDetections {
    let ids: Vec<Option<i64>> = detections.iter().map(|d| d.id).collect();
    let confidences: Vec<Option<f32>> = detections.iter().map(|d| d.confidence).collect();
    RawDetections {
        boxes: detections.iter().map(|d| d.bbox).collect(),
        ids: ids.iter().any(Option::is_some).then_some(ids),
        confidences: confidences.iter().any(Option::is_some).then_some(confidences),
    }
}
