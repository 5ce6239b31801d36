//! rendering — focus compositing and detection overlay
//!
//! The whole frame is Gaussian-blurred and the subject is pasted back sharp,
//! either as its bounding box (hard focus) or as a GrabCut silhouette (soft
//! focus). With no subject box the frame is uniformly blurred.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::debug;

use crate::detection::{BoundingBox, DetectionRecord};
use crate::segmentation::{segment_foreground, DEFAULT_ITERATIONS};
use crate::video::RgbFrame;

/// Gaussian sigma matching a 35×35 kernel with automatic sigma
/// (`0.3 · ((35 − 1) / 2 − 1) + 0.8`).
pub const BLUR_SIGMA: f32 = 5.6;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusMode {
    /// Sharp rectangle around the subject.
    #[default]
    Hard,
    /// Sharp silhouette, falling back to the rectangle when segmentation fails.
    Soft,
}

impl FocusMode {
    pub fn from_soft_flag(soft: bool) -> Self {
        if soft {
            FocusMode::Soft
        } else {
            FocusMode::Hard
        }
    }
}

/// Blur the whole frame.
pub fn blur_frame(frame: &RgbFrame) -> RgbFrame {
    if frame.is_empty() {
        return frame.clone();
    }
    let blurred = imageproc::filter::gaussian_blur_f32(&frame.to_image(), BLUR_SIGMA);
    RgbFrame::from_image(blurred, frame.pts)
}

/// Composite one frame: sharp subject over a blurred background.
pub fn apply_focus(frame: &RgbFrame, bbox: Option<BoundingBox>, mode: FocusMode) -> RgbFrame {
    let mut out = blur_frame(frame);
    let Some(bbox) = bbox else {
        return out;
    };

    if mode == FocusMode::Soft {
        if let Some(mask) = segment_foreground(frame, bbox, DEFAULT_ITERATIONS) {
            for (i, &fg) in mask.as_slice().iter().enumerate() {
                if fg {
                    out.data[i * 3..i * 3 + 3].copy_from_slice(&frame.data[i * 3..i * 3 + 3]);
                }
            }
            return out;
        }
        debug!(?bbox, "segmentation unavailable, using hard focus");
    }

    paste_box(&mut out, frame, bbox);
    out
}

/// Copy the clamped `bbox` region of `src` into `dst` (same geometry).
fn paste_box(dst: &mut RgbFrame, src: &RgbFrame, bbox: BoundingBox) {
    let Some(b) = bbox.clamp_to(src.width, src.height) else {
        return;
    };
    let stride = src.width as usize * 3;
    let (x1, x2) = (b.x1 as usize * 3, b.x2 as usize * 3);
    for y in b.y1 as usize..b.y2 as usize {
        let row = y * stride;
        dst.data[row + x1..row + x2].copy_from_slice(&src.data[row + x1..row + x2]);
    }
}

/// Draws detection boxes and "ID n 0.87" labels. Labels need a font; without
/// one only rectangles are drawn.
#[derive(Default)]
pub struct Overlay {
    font: Option<FontVec>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("could not read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| anyhow::anyhow!("invalid font {}: {e}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, frame: &mut RgbFrame, records: &[DetectionRecord]) {
        if records.is_empty() || frame.is_empty() {
            return;
        }
        let mut img = frame.to_image();
        for record in records {
            let Some(b) = record.bbox.clamp_to(img.width(), img.height()) else {
                continue;
            };
            for inset in 0..BOX_THICKNESS {
                let (w, h) = (b.width() - 2 * inset, b.height() - 2 * inset);
                if w <= 0 || h <= 0 {
                    break;
                }
                let rect = Rect::at(b.x1 + inset, b.y1 + inset).of_size(w as u32, h as u32);
                draw_hollow_rect_mut(&mut img, rect, BOX_COLOR);
            }

            let text = label(record);
            if let (Some(font), false) = (&self.font, text.is_empty()) {
                let y = (b.y1 - LABEL_SCALE as i32 - 2).max(0);
                draw_text_mut(&mut img, BOX_COLOR, b.x1, y, PxScale::from(LABEL_SCALE), font, &text);
            }
        }
        *frame = RgbFrame::from_image(img, frame.pts);
    }
}

/// `"ID 3 0.87"`, `"ID 3"`, `"0.87"` or empty, depending on what the
/// detector supplied.
pub fn label(record: &DetectionRecord) -> String {
    let id = record.track_id.map(|id| format!("ID {id}"));
    let conf = record.confidence.map(|c| format!("{c:.2}"));
    match (id, conf) {
        (Some(id), Some(conf)) => format!("{id} {conf}"),
        (Some(s), None) | (None, Some(s)) => s,
        (None, None) => String::new(),
    }
}
